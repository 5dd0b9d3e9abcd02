//! 事务日志（WAL）
//!
//! 追加式侧文件，帧格式沿用数据帧的定式：
//! bincode 定长头 `{checksum: u32, data_len: u32}` + bincode 载荷。
//! 日志自带内部锁，位于引擎锁层级之外（与 CRUD 路径没有读竞争）

use anyhow::Result;
use chrono::Local;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::fn_util::checksum;
use crate::common::types::ByteVec;

/// checksum (4 bytes) + data_length (4 bytes)
pub const FRAME_HEADER_SIZE: usize = 8;

/// 操作类型
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Create,
    Update,
    Delete,
    BatchStart,
    BatchItemCreate,
    BatchItemFail,
    BatchCommit,
    BatchRollback,
    CompactStart,
    CompactSuccess,
    CompactFail,
}

/// 事务状态
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Commit,
    Rollback,
}

/// 单条日志条目；终结条目单独追加，通过 tx_id 归并
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxEntry {
    pub tx_id: u64,
    pub op: TxOp,
    pub record_id: i32,
    /// 变更前的完整 slot 字节（没有则为空）
    pub before: ByteVec,
    /// 变更后的完整 slot 字节
    pub after: ByteVec,
    pub status: TxStatus,
    pub ts: i64,
}

/// 帧头布局
#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct FrameHeader {
    checksum: u32,
    data_len: u32,
}

#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TransactionLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(TransactionLog {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// 追加一条日志并立即刷盘
    pub fn log(
        &self,
        op: TxOp,
        tx_id: u64,
        record_id: i32,
        before: ByteVec,
        after: ByteVec,
        status: TxStatus,
    ) -> Result<()> {
        let entry = TxEntry {
            tx_id,
            op,
            record_id,
            before,
            after,
            status,
            ts: Local::now().timestamp_millis(),
        };
        let data_byte = bincode::serialize(&entry)?;
        let header = FrameHeader {
            checksum: checksum(data_byte.as_slice()),
            data_len: data_byte.len() as u32,
        };
        let mut frame = bincode::serialize(&header)?;
        frame.extend_from_slice(&data_byte);

        let mut writer = self.writer.lock().unwrap();
        writer.write_all(frame.as_slice())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// 追加终结标记
    pub fn terminate(&self, op: TxOp, tx_id: u64, record_id: i32, status: TxStatus) -> Result<()> {
        self.log(op, tx_id, record_id, Vec::new(), Vec::new(), status)
    }

    /// 回放全部条目；损坏的尾部帧记日志后丢弃
    fn load_all(&self) -> Result<Vec<TxEntry>> {
        let mut entries = Vec::new();
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        loop {
            let mut header_buf = [0_u8; FRAME_HEADER_SIZE];
            match reader.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let header: FrameHeader = bincode::deserialize(&header_buf)?;
            let mut data_buf = ByteVec::with_capacity(header.data_len as usize);
            reader
                .by_ref()
                .take(header.data_len as u64)
                .read_to_end(&mut data_buf)?;
            if data_buf.len() != header.data_len as usize
                || checksum(data_buf.as_slice()) != header.checksum
            {
                // 崩溃时被截断的最后一帧
                warn!("discarding torn wal frame after {} entries", entries.len());
                break;
            }
            entries.push(bincode::deserialize::<TxEntry>(data_buf.as_slice())?);
        }
        Ok(entries)
    }

    /// 待恢复事务：每个操作条目附上归并出的最终状态
    ///
    /// 终结条目先按 (tx_id, record_id) 精确匹配；批量与压缩的
    /// 整体标记按 tx_id 兜底，覆盖尚无单条终结的条目
    pub fn pending(&self) -> Result<Vec<TxEntry>> {
        let entries = self.load_all()?;
        let mut tx_terminal: HashMap<u64, TxStatus> = HashMap::new();
        let mut op_terminal: HashMap<(u64, i32), TxStatus> = HashMap::new();
        for e in entries.iter() {
            match e.op {
                TxOp::BatchCommit | TxOp::CompactSuccess => {
                    tx_terminal.insert(e.tx_id, TxStatus::Commit);
                }
                TxOp::BatchRollback | TxOp::CompactFail => {
                    tx_terminal.insert(e.tx_id, TxStatus::Rollback);
                }
                _ => {
                    if e.status != TxStatus::Pending {
                        op_terminal.insert((e.tx_id, e.record_id), e.status);
                    }
                }
            }
        }
        let mut out = Vec::new();
        for mut e in entries {
            let is_marker = matches!(
                e.op,
                TxOp::BatchCommit | TxOp::BatchRollback | TxOp::CompactSuccess | TxOp::CompactFail
            ) || e.status != TxStatus::Pending;
            if is_marker {
                continue;
            }
            if let Some(&status) = op_terminal.get(&(e.tx_id, e.record_id)) {
                e.status = status;
            } else if let Some(&status) = tx_terminal.get(&e.tx_id) {
                e.status = status;
            }
            out.push(e);
        }
        info!("wal pending entries: {}", out.len());
        Ok(out)
    }

    /// 恢复确认数据文件一致后清空日志
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush()?;
        let file = writer.get_ref();
        file.set_len(0)?;
        writer.get_mut().seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(std::fs::metadata(&self.path)?.len() == 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn wal_in(dir: &TempDir) -> TransactionLog {
        TransactionLog::open(dir.path().join("store.wal")).unwrap()
    }

    #[test]
    fn pending_resolution_test() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = wal_in(&dir);

        wal.log(TxOp::Create, 1, 7, vec![], vec![1, 2, 3], TxStatus::Pending)?;
        wal.terminate(TxOp::Create, 1, 7, TxStatus::Commit)?;

        wal.log(TxOp::Update, 2, 8, vec![9], vec![8], TxStatus::Pending)?;
        wal.terminate(TxOp::Update, 2, 8, TxStatus::Rollback)?;

        wal.log(TxOp::Delete, 3, 9, vec![5], vec![], TxStatus::Pending)?;

        let pending = wal.pending()?;
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].status, TxStatus::Commit);
        assert_eq!(pending[0].after, vec![1, 2, 3]);
        assert_eq!(pending[1].status, TxStatus::Rollback);
        assert_eq!(pending[2].status, TxStatus::Pending);
        Ok(())
    }

    #[test]
    fn batch_markers_test() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = wal_in(&dir);

        wal.log(TxOp::BatchStart, 5, -1, vec![], vec![], TxStatus::Pending)?;
        wal.log(TxOp::BatchItemCreate, 5, 11, vec![], vec![4], TxStatus::Pending)?;
        wal.log(TxOp::BatchItemCreate, 5, 12, vec![], vec![5], TxStatus::Pending)?;
        wal.terminate(TxOp::BatchCommit, 5, -1, TxStatus::Commit)?;

        let pending = wal.pending()?;
        // BatchCommit 标记本身被过滤，条目全部解析为 Commit
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|e| e.status == TxStatus::Commit));
        Ok(())
    }

    #[test]
    fn batch_partial_item_test() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = wal_in(&dir);

        // 批量中途崩溃：第一条已单条终结，第二条悬空，没有整体标记
        wal.log(TxOp::BatchStart, 6, -1, vec![], vec![], TxStatus::Pending)?;
        wal.log(TxOp::BatchItemCreate, 6, 21, vec![], vec![1], TxStatus::Pending)?;
        wal.terminate(TxOp::BatchItemCreate, 6, 21, TxStatus::Commit)?;
        wal.log(TxOp::BatchItemCreate, 6, 22, vec![], vec![2], TxStatus::Pending)?;

        let pending = wal.pending()?;
        let item_21 = pending.iter().find(|e| e.record_id == 21).unwrap();
        let item_22 = pending.iter().find(|e| e.record_id == 22).unwrap();
        assert_eq!(item_21.status, TxStatus::Commit);
        assert_eq!(item_22.status, TxStatus::Pending);
        Ok(())
    }

    #[test]
    fn clear_test() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = wal_in(&dir);
        wal.log(TxOp::Create, 1, 1, vec![], vec![1], TxStatus::Pending)?;
        assert!(!wal.is_empty()?);
        wal.clear()?;
        assert!(wal.is_empty()?);
        assert!(wal.pending()?.is_empty());
        // 清空后可以继续追加
        wal.log(TxOp::Create, 2, 2, vec![], vec![2], TxStatus::Pending)?;
        assert_eq!(wal.pending()?.len(), 1);
        Ok(())
    }

    #[test]
    fn torn_tail_test() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("store.wal");
        {
            let wal = TransactionLog::open(&path)?;
            wal.log(TxOp::Create, 1, 1, vec![], vec![1, 1, 1], TxStatus::Pending)?;
            wal.terminate(TxOp::Create, 1, 1, TxStatus::Commit)?;
        }
        // 模拟崩溃：截掉最后几个字节
        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 3)?;
        drop(file);

        let wal = TransactionLog::open(&path)?;
        let pending = wal.pending()?;
        // 第一条完整保留，撕裂的终结帧被丢弃
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TxStatus::Pending);
        Ok(())
    }
}
