//! 自由空间管理：first-fit 分配 + bincode 侧文件持久化
//!
//! 刻意保持简单：不做 best-fit，也不合并相邻块，碎片由周期性压缩兜底

use anyhow::Result;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 一段可复用的文件区间
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug)]
pub struct FreeSpaceList {
    /// 按 offset 升序，互不重叠
    blocks: Vec<FreeBlock>,
    path: PathBuf,
    /// 文件头之后数据区的起始偏移，之前的区间一律拒绝
    data_start: u64,
    /// 分裂剩余低于该值时整块让渡，避免产生无法描述的碎屑
    min_split: u32,
}

impl FreeSpaceList {
    /// 从侧文件加载；不存在则从空列表开始
    pub fn load<P: AsRef<Path>>(path: P, data_start: u64, min_split: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut blocks: Vec<FreeBlock> = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            bincode::deserialize_from(reader).unwrap_or_else(|err| {
                warn!("free list [{:?}] unreadable, resetting: {}", path, err);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let before = blocks.len();
        blocks.retain(|b| b.offset >= data_start);
        if blocks.len() != before {
            warn!(
                "dropped {} free blocks overlapping the header region",
                before - blocks.len()
            );
        }
        blocks.sort_by_key(|b| b.offset);
        info!("free list loaded, {} blocks", blocks.len());
        Ok(FreeSpaceList {
            blocks,
            path,
            data_start,
            min_split,
        })
    }

    /// 登记一个新的自由块；头部区域内的偏移记日志后忽略
    pub fn add_free_block(&mut self, offset: u64, size: u32) -> Result<()> {
        if offset < self.data_start {
            warn!(
                "ignoring free block at {} inside the header region (< {})",
                offset, self.data_start
            );
            return Ok(());
        }
        let pos = self.blocks.partition_point(|b| b.offset < offset);
        // 同一偏移重复登记（侧文件与扫描重建重叠）保留较大的块
        if let Some(existing) = self.blocks.get_mut(pos) {
            if existing.offset == offset {
                existing.size = existing.size.max(size);
                return self.persist();
            }
        }
        self.blocks.insert(pos, FreeBlock { offset, size });
        self.persist()
    }

    /// first-fit 查找；命中时返回 (让渡块, 分裂出的剩余块)
    ///
    /// 剩余块已经重新挂回列表，同时返回给调用方以便在数据文件上盖占位 slot
    pub fn get_free_block(&mut self, required: u32) -> Result<Option<(FreeBlock, Option<FreeBlock>)>> {
        let pos = match self.blocks.iter().position(|b| b.size >= required) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let block = self.blocks.remove(pos);
        let (granted, remainder) = if block.size - required >= self.min_split {
            let granted = FreeBlock {
                offset: block.offset,
                size: required,
            };
            let remainder = FreeBlock {
                offset: block.offset + required as u64,
                size: block.size - required,
            };
            let rpos = self.blocks.partition_point(|b| b.offset < remainder.offset);
            self.blocks.insert(rpos, remainder);
            (granted, Some(remainder))
        } else {
            // 剩余太小，整块让渡
            (block, None)
        };
        self.persist()?;
        Ok(Some((granted, remainder)))
    }

    /// 压缩成功后清空
    pub fn clear(&mut self) -> Result<()> {
        self.blocks.clear();
        self.persist()
    }

    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[cfg(test)]
    fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    /// 每次变更后整体重写侧文件
    pub fn persist(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.blocks)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    const DATA_START: u64 = 32;
    const MIN_SPLIT: u32 = 37;

    fn new_list(dir: &TempDir) -> FreeSpaceList {
        FreeSpaceList::load(dir.path().join("store.flist"), DATA_START, MIN_SPLIT).unwrap()
    }

    #[test]
    fn first_fit_and_split_test() -> Result<()> {
        let dir = TempDir::new()?;
        let mut list = new_list(&dir);
        list.add_free_block(500, 100)?;
        list.add_free_block(100, 200)?;

        // first-fit 命中 offset 100 的块并分裂
        let (granted, remainder) = list.get_free_block(80)?.unwrap();
        assert_eq!(granted, FreeBlock { offset: 100, size: 80 });
        assert_eq!(remainder, Some(FreeBlock { offset: 180, size: 120 }));
        assert!(granted.size >= 80);

        // 列表仍然有序且不重叠
        let blocks = list.blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].offset + pair[0].size as u64 <= pair[1].offset);
        }
        Ok(())
    }

    #[test]
    fn small_remainder_absorbed_test() -> Result<()> {
        let dir = TempDir::new()?;
        let mut list = new_list(&dir);
        list.add_free_block(100, 100)?;
        // 剩余 20 字节低于 MIN_SPLIT，整块让渡
        let (granted, remainder) = list.get_free_block(80)?.unwrap();
        assert_eq!(granted.size, 100);
        assert_eq!(remainder, None);
        assert!(list.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_offset_dedupe_test() -> Result<()> {
        let dir = TempDir::new()?;
        let mut list = new_list(&dir);
        list.add_free_block(100, 50)?;
        // 同一偏移重复登记只保留较大的块
        list.add_free_block(100, 64)?;
        assert_eq!(list.len(), 1);
        assert_eq!(list.free_bytes(), 64);
        Ok(())
    }

    #[test]
    fn no_fit_test() -> Result<()> {
        let dir = TempDir::new()?;
        let mut list = new_list(&dir);
        list.add_free_block(100, 50)?;
        assert!(list.get_free_block(51)?.is_none());
        assert_eq!(list.len(), 1);
        Ok(())
    }

    #[test]
    fn header_region_rejected_test() -> Result<()> {
        let dir = TempDir::new()?;
        let mut list = new_list(&dir);
        list.add_free_block(8, 100)?;
        assert!(list.is_empty());
        list.add_free_block(DATA_START, 100)?;
        assert_eq!(list.len(), 1);
        Ok(())
    }

    #[test]
    fn persistence_roundtrip_test() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let mut list = new_list(&dir);
            list.add_free_block(100, 64)?;
            list.add_free_block(300, 128)?;
        }
        let reloaded = new_list(&dir);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.free_bytes(), 192);
        Ok(())
    }
}
