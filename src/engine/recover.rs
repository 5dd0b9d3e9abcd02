//! 崩溃恢复：正向扫描重建索引，再回放 WAL 收敛未决事务
//!
//! 数据文件本身是权威：索引、空闲表都能从 slot 扫描推导出来。
//! WAL 只负责把崩溃瞬间的半截事务拉回一致状态，
//! 回放完成后清空日志

use anyhow::Result;
use log::{info, warn};
use std::collections::HashMap;

use crate::engine::btree::BPlusTree;
use crate::engine::data_file::{FileManager, DATA_START_OFFSET};
use crate::engine::free_space::FreeSpaceList;
use crate::engine::record;
use crate::engine::wal::{TransactionLog, TxOp, TxStatus};

/// 正向扫描的产出
#[derive(Debug, Default)]
pub struct ScanReport {
    /// 存活记录数
    pub live: usize,
    /// 洞与墓碑
    pub holes: usize,
    /// 校验和不一致的 slot 数
    pub corrupt: usize,
    /// 扫描到的最大 id
    pub max_id: i32,
}

/// 从头到尾遍历数据文件，把存活记录插入索引，
/// 洞、墓碑与重复 id 的旧版本归入空闲表
pub fn rebuild_index(
    files: &FileManager,
    index: &mut BPlusTree,
    free: &mut FreeSpaceList,
) -> Result<ScanReport> {
    let file_len = files.actual_len()?;
    let mut report = ScanReport::default();
    let mut buf = Vec::with_capacity(files.max_slot() as usize);
    // id -> (offset, version, slot_len)，重复时高版本胜出
    let mut survivors: HashMap<i32, (u64, u32, u32)> = HashMap::new();
    let mut free_blocks: Vec<(u64, u32)> = Vec::new();

    let mut offset = DATA_START_OFFSET;
    while offset < file_len {
        let slot_len = match files.read_slot_raw(offset, &mut buf) {
            Ok(n) => n as u32,
            Err(e) => {
                // slot 长度不可信，后续无法步进，按截断尾部处理
                warn!("scan stops at offset {}: {}", offset, e);
                break;
            }
        };
        if !record::validate_checksum(&buf) {
            report.corrupt += 1;
            free_blocks.push((offset, slot_len));
            offset += slot_len as u64;
            continue;
        }
        let rec = record::deserialize(&buf)?;
        if rec.id <= 0 || !rec.active {
            report.holes += 1;
            free_blocks.push((offset, slot_len));
            offset += slot_len as u64;
            continue;
        }
        if rec.id > report.max_id {
            report.max_id = rec.id;
        }
        match survivors.get(&rec.id) {
            // 低版本副本作废
            Some(&(_, old_ver, _)) if old_ver >= rec.version => {
                free_blocks.push((offset, slot_len));
            }
            Some(&(old_off, _, old_len)) => {
                free_blocks.push((old_off, old_len));
                survivors.insert(rec.id, (offset, rec.version, slot_len));
            }
            None => {
                survivors.insert(rec.id, (offset, rec.version, slot_len));
            }
        }
        offset += slot_len as u64;
    }

    for (id, (off, _, _)) in survivors.iter() {
        index.insert(*id, *off)?;
    }
    report.live = survivors.len();
    for (off, len) in free_blocks {
        free.add_free_block(off, len)?;
    }
    info!(
        "index rebuilt: {} live, {} hole(s), {} corrupt slot(s), max id {}",
        report.live, report.holes, report.corrupt, report.max_id
    );
    Ok(report)
}

/// 回放 WAL 里状态未收敛的事务并清空日志，返回处理的条目数
///
/// 提交而数据未落盘的变更重做，未提交的变更用前像回滚。
/// 重做与回滚都通过重建后的索引定位，天然幂等
pub fn replay_wal(
    files: &FileManager,
    index: &mut BPlusTree,
    free: &mut FreeSpaceList,
    wal: &TransactionLog,
) -> Result<usize> {
    let entries = wal.pending()?;
    let mut handled = 0_usize;

    for entry in &entries {
        match (entry.op, entry.status) {
            // 已收敛到 Commit 的压缩不是中断现场，跳过
            (TxOp::CompactStart, TxStatus::Commit) => {}
            (TxOp::CompactStart, _) => {
                // 临时文件由打开流程清理，数据文件未被替换
                warn!("interrupted compaction found in log, original file kept");
                handled += 1;
            }
            (TxOp::BatchItemFail, _) => {}
            (TxOp::Create | TxOp::BatchItemCreate, TxStatus::Commit) => {
                if !index.contains(entry.record_id) && !entry.after.is_empty() {
                    redo_append(files, index, &entry.after)?;
                    handled += 1;
                }
            }
            (TxOp::Create | TxOp::BatchItemCreate, _) => {
                if let Some(off) = index.lookup(entry.record_id) {
                    retire_slot(files, free, off)?;
                    index.delete(entry.record_id);
                    handled += 1;
                }
            }
            (TxOp::Update, TxStatus::Commit) => {
                if ensure_image(files, index, free, entry.record_id, &entry.after)? {
                    handled += 1;
                }
            }
            (TxOp::Update, _) => {
                if entry.before.is_empty() {
                    warn!(
                        "update of record {} has no before image, skipped",
                        entry.record_id
                    );
                } else if ensure_image(files, index, free, entry.record_id, &entry.before)? {
                    handled += 1;
                }
            }
            (TxOp::Delete, TxStatus::Commit) => {
                if let Some(off) = index.lookup(entry.record_id) {
                    retire_slot(files, free, off)?;
                    index.delete(entry.record_id);
                    handled += 1;
                }
            }
            (TxOp::Delete, _) => {
                if !index.contains(entry.record_id) && !entry.before.is_empty() {
                    redo_append(files, index, &entry.before)?;
                    handled += 1;
                }
            }
            _ => {}
        }
    }

    wal.clear()?;
    if handled > 0 {
        info!("wal replay resolved {} change(s)", handled);
    }
    Ok(handled)
}

/// 把镜像追加到文件尾并登记索引
fn redo_append(files: &FileManager, index: &mut BPlusTree, image: &[u8]) -> Result<()> {
    let rec = record::deserialize(image)?;
    let offset = files.append_reserve(image.len() as u64);
    files.write_slot_raw(offset, image)?;
    index.insert(rec.id, offset)?;
    Ok(())
}

/// 让 id 当前的 slot 内容与镜像一致；不一致时旧位作废、镜像追加
fn ensure_image(
    files: &FileManager,
    index: &mut BPlusTree,
    free: &mut FreeSpaceList,
    id: i32,
    image: &[u8],
) -> Result<bool> {
    if image.is_empty() {
        return Ok(false);
    }
    let want = record::deserialize(image)?;
    let mut buf = Vec::with_capacity(files.max_slot() as usize);
    match index.lookup(id) {
        Some(off) => {
            let on_disk = files
                .read_slot_raw(off, &mut buf)
                .ok()
                .filter(|_| record::validate_checksum(&buf))
                .and_then(|_| record::deserialize(&buf).ok());
            if on_disk.as_ref() == Some(&want) {
                return Ok(false);
            }
            retire_slot(files, free, off)?;
            index.delete(id);
            redo_append(files, index, image)?;
            Ok(true)
        }
        None => {
            redo_append(files, index, image)?;
            Ok(true)
        }
    }
}

/// 把 offset 处的 slot 盖成洞并归入空闲表
fn retire_slot(files: &FileManager, free: &mut FreeSpaceList, offset: u64) -> Result<()> {
    let mut buf = Vec::with_capacity(files.max_slot() as usize);
    let slot_len = files.read_slot_raw(offset, &mut buf)? as u32;
    files.write_slot_raw(offset, &record::hole_slot(slot_len as usize)?)?;
    free.add_free_block(offset, slot_len)?;
    Ok(())
}
