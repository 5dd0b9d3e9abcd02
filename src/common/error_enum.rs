//! 自定义error
use thiserror::Error;

/// 所有的错误类型
///
/// 公共 API 统一返回 `anyhow::Result`，调用方通过
/// `err.downcast_ref::<StoreError>()` 区分具体类别
#[derive(Error, Debug)]
pub enum StoreError {
    /// 字段校验失败，不会进入 WAL
    #[error("validation failed: {0}")]
    Validation(String),

    /// id 不存在（update/delete 路径）
    #[error("record id: [{0}] not found")]
    NotFound(i32),

    /// checksum 不匹配，数据损坏
    #[error("data corruption at offset {offset} (expected {saved_checksum:?}, got {checksum:?})")]
    DataCorruption {
        offset: u64,
        checksum: u64,
        saved_checksum: u64,
    },

    /// 读取越过文件边界，或 slot 长度非法
    #[error("slot out of bounds: offset {offset}, slot_len {slot_len}, file_len {file_len}")]
    OutOfBounds {
        offset: u64,
        slot_len: u32,
        file_len: u64,
    },

    /// 编码后长度超过 max_record_size
    #[error("payload size {size} exceeds max record size {max}")]
    Capacity { size: u32, max: u32 },

    /// close 时 worker pool 在限定时间内没有排空
    #[error("worker pool failed to drain within {0} secs")]
    DeadlineExceeded(u64),
}
