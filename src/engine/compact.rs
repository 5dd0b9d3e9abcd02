//! 压缩：把存活 slot 紧凑重写进新文件，回收碎片空间
//!
//! 调用方持有引擎全局写锁，期间没有并发读写，
//! 所以可以走 `*_raw` 免段锁路径。原地压缩用临时文件加原子
//! rename 换入；导出压缩只产出目标文件，不动原文件

use anyhow::Result;
use log::{info, warn};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::engine::btree::BPlusTree;
use crate::engine::data_file::{FileHeader, FileManager, HEADER_SIZE};
use crate::engine::free_space::FreeSpaceList;
use crate::engine::record;
use crate::engine::wal::{TransactionLog, TxOp, TxStatus};

/// 一次压缩的结果摘要
#[derive(Debug, Clone, Copy)]
pub struct CompactStats {
    pub records_copied: usize,
    pub records_dropped: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub duration_ms: u128,
}

impl CompactStats {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// 执行压缩。target 为 None 时原地替换数据文件并更新索引，
/// 否则把紧凑副本写到 target，原文件保持不变
pub fn run_compaction(
    files: &FileManager,
    index: &mut BPlusTree,
    free: &mut FreeSpaceList,
    wal: &TransactionLog,
    tx_id: u64,
    target: Option<&Path>,
) -> Result<CompactStats> {
    wal.log(TxOp::CompactStart, tx_id, 0, Vec::new(), Vec::new(), TxStatus::Pending)?;

    let temp_path = match target {
        Some(p) => p.to_path_buf(),
        None => sibling_temp(files.path()),
    };
    match copy_live_slots(files, index, free, target.is_none(), &temp_path) {
        Ok(stats) => {
            wal.terminate(TxOp::CompactSuccess, tx_id, 0, TxStatus::Commit)?;
            info!(
                "compaction done: {} record(s) copied, {} byte(s) reclaimed in {} ms",
                stats.records_copied,
                stats.bytes_reclaimed(),
                stats.duration_ms
            );
            Ok(stats)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            wal.terminate(TxOp::CompactFail, tx_id, 0, TxStatus::Rollback)?;
            Err(e)
        }
    }
}

fn sibling_temp(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".compact");
    path.with_file_name(name)
}

fn copy_live_slots(
    files: &FileManager,
    index: &mut BPlusTree,
    free: &mut FreeSpaceList,
    in_place: bool,
    temp_path: &Path,
) -> Result<CompactStats> {
    let start = Instant::now();
    let header = files.header();
    let bytes_before = files.actual_len()?;

    let temp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(temp);
    // 头部先占位，复制完再回填
    writer.write_all(&[0_u8; HEADER_SIZE as usize])?;

    let mut buf = Vec::with_capacity(files.max_slot() as usize);
    let mut remaps: Vec<(i32, u64, u64)> = Vec::new();
    let mut dropped: Vec<i32> = Vec::new();
    let mut next_offset = HEADER_SIZE;

    // 按旧文件偏移顺序复制，让顺序读落在顺序写上
    let mut entries: Vec<(i32, u64)> = index
        .all_ids()
        .into_iter()
        .filter_map(|id| index.lookup(id).map(|off| (id, off)))
        .collect();
    entries.sort_by_key(|&(_, off)| off);

    for (id, old_offset) in entries {
        let slot_len = match files.read_slot_raw(old_offset, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("compaction drops record {}: {}", id, e);
                dropped.push(id);
                continue;
            }
        };
        if !record::validate_checksum(&buf) {
            warn!("compaction drops record {}: checksum mismatch", id);
            dropped.push(id);
            continue;
        }
        // slot 原样搬运，校验和无需重算
        writer.write_all(&buf[..slot_len])?;
        remaps.push((id, old_offset, next_offset));
        next_offset += slot_len as u64;
    }

    let new_header = FileHeader {
        // 导出副本是一致快照，直接标记为干净
        valid: if in_place { header.valid } else { true },
        file_size: next_offset,
        last_id: header.last_id,
    };
    writer.flush()?;
    let temp = writer.into_inner()?;
    temp.write_all_at(&new_header.encode(), 0)?;
    temp.sync_all()?;
    drop(temp);

    if in_place {
        files.swap_file(temp_path, new_header)?;
        for &(id, old, new) in &remaps {
            index.update_offset(id, old, new);
        }
        for id in &dropped {
            index.delete(*id);
        }
        free.clear()?;
    }

    Ok(CompactStats {
        records_copied: remaps.len(),
        records_dropped: dropped.len(),
        bytes_before,
        bytes_after: next_offset,
        duration_ms: start.elapsed().as_millis(),
    })
}
