use crc32fast::Hasher;
use log::LevelFilter;
use std::io::Write;

/// 根据字节序列获取 u32 checksum 值
pub fn checksum(content: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize()
}

/// record slot 头部存储的是加宽到 u64 的 checksum
pub fn checksum_u64(content: &[u8]) -> u64 {
    checksum(content) as u64
}

/// 日志格式初始化
pub fn log_init() {
    let _ = env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}: {}",
                record.line().unwrap_or(0),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
