//! 数据文件管理：文件头、slot 读写、段锁
//!
//! 文件布局 `[header 32B][slot]*`。句柄用定位 I/O（`FileExt`），
//! 读写本身不移动游标，段锁负责 record 粒度的互斥；
//! 压缩等结构性操作在引擎全局写锁下走 `*_raw` 免段锁路径

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::info;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::common::error_enum::StoreError;
use crate::common::types::ByteVec;
use crate::engine::record::{RECORD_MIN_LEN, SLOT_PREFIX_SIZE};

/// 文件头固定 32 字节：magic + valid + file_size + last_id + 补零
pub const HEADER_SIZE: u64 = 32;
const MAGIC: u64 = 0x5245_4353_544f_5245; // "RECSTORE"

/// 数据区起始偏移
pub const DATA_START_OFFSET: u64 = HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// 干净关闭标志：open 后压成 false，close 写回 true
    pub valid: bool,
    pub file_size: u64,
    pub last_id: i32,
}

impl FileHeader {
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0_u8; HEADER_SIZE as usize];
        BigEndian::write_u64(&mut buf[0..8], MAGIC);
        buf[8] = self.valid as u8;
        BigEndian::write_u64(&mut buf[9..17], self.file_size);
        BigEndian::write_i32(&mut buf[17..21], self.last_id);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if BigEndian::read_u64(&buf[0..8]) != MAGIC {
            anyhow::bail!("not a recstore data file (bad magic)");
        }
        Ok(FileHeader {
            valid: buf[8] != 0,
            file_size: BigEndian::read_u64(&buf[9..17]),
            last_id: BigEndian::read_i32(&buf[17..21]),
        })
    }
}

#[derive(Debug)]
pub struct FileManager {
    path: PathBuf,
    /// 写锁仅在压缩换文件时持有
    file: RwLock<File>,
    header: Mutex<FileHeader>,
    segments: Vec<RwLock<()>>,
    /// 段哈希单位，取 max_record_size
    slot_unit: u64,
    /// slot_len 的合法上限：max_record_size 加上整块让渡的最大溢出
    max_slot: u32,
    sync_writes: bool,
}

impl FileManager {
    /// 打开或新建数据文件，返回 (manager, 是否新建, 是否非干净关闭)
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_record_size: u32,
        segment_count: usize,
        sync_writes: bool,
    ) -> Result<(Self, bool, bool)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let actual_len = file.metadata()?.len();

        let (header, created, unclean) = if actual_len == 0 {
            let header = FileHeader {
                valid: true,
                file_size: HEADER_SIZE,
                last_id: 0,
            };
            file.write_all_at(&header.encode(), 0)?;
            file.sync_data()?;
            (header, true, false)
        } else {
            let mut buf = [0_u8; HEADER_SIZE as usize];
            file.read_exact_at(&mut buf, 0)?;
            let stored = FileHeader::decode(&buf)?;
            let unclean = !stored.valid || stored.file_size != actual_len;
            if unclean {
                info!(
                    "unclean shutdown detected: valid={}, header size={}, actual size={}",
                    stored.valid, stored.file_size, actual_len
                );
            }
            // 后续追加以真实长度为准
            let header = FileHeader {
                valid: stored.valid,
                file_size: actual_len,
                last_id: stored.last_id,
            };
            (header, false, unclean)
        };

        let segments = (0..segment_count.max(1)).map(|_| RwLock::new(())).collect();
        Ok((
            FileManager {
                path,
                file: RwLock::new(file),
                header: Mutex::new(header),
                segments,
                slot_unit: max_record_size.max(1) as u64,
                max_slot: max_record_size + RECORD_MIN_LEN as u32,
                sync_writes,
            },
            created,
            unclean,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_slot(&self) -> u32 {
        self.max_slot
    }

    fn segment(&self, offset: u64) -> &RwLock<()> {
        let idx = (offset / self.slot_unit) as usize % self.segments.len();
        &self.segments[idx]
    }

    pub fn actual_len(&self) -> Result<u64> {
        Ok(self.file.read().unwrap().metadata()?.len())
    }

    /// 读出 offset 处的完整 slot 到 buf，返回 slot 长度
    pub fn read_slot(&self, offset: u64, buf: &mut ByteVec) -> Result<usize> {
        let _seg = self.segment(offset).read().unwrap();
        self.read_slot_inner(offset, buf)
    }

    /// 免段锁版本，调用方必须已持有引擎全局写锁
    pub fn read_slot_raw(&self, offset: u64, buf: &mut ByteVec) -> Result<usize> {
        self.read_slot_inner(offset, buf)
    }

    fn read_slot_inner(&self, offset: u64, buf: &mut ByteVec) -> Result<usize> {
        let file = self.file.read().unwrap();
        let file_len = file.metadata()?.len();
        let bounds_err = |slot_len: u32| {
            anyhow::Error::from(StoreError::OutOfBounds {
                offset,
                slot_len,
                file_len,
            })
        };
        if offset < DATA_START_OFFSET || offset + SLOT_PREFIX_SIZE as u64 > file_len {
            return Err(bounds_err(0));
        }
        let mut prefix = [0_u8; SLOT_PREFIX_SIZE];
        file.read_exact_at(&mut prefix, offset)?;
        let slot_len = BigEndian::read_i32(&prefix[8..12]);
        if slot_len < RECORD_MIN_LEN as i32
            || slot_len as u32 > self.max_slot
            || offset + slot_len as u64 > file_len
        {
            return Err(bounds_err(slot_len.max(0) as u32));
        }
        buf.resize(slot_len as usize, 0);
        file.read_exact_at(buf.as_mut_slice(), offset)?;
        Ok(slot_len as usize)
    }

    /// 在段写锁保护下写入一个完整 slot
    pub fn write_slot(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let _seg = self.segment(offset).write().unwrap();
        self.write_slot_inner(offset, bytes)
    }

    /// 免段锁版本，调用方必须已持有引擎全局写锁
    pub fn write_slot_raw(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.write_slot_inner(offset, bytes)
    }

    fn write_slot_inner(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.file.read().unwrap();
        file.write_all_at(bytes, offset)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    /// 在文件尾预留 size 字节，返回分配到的偏移
    pub fn append_reserve(&self, size: u64) -> u64 {
        let mut header = self.header.lock().unwrap();
        let offset = header.file_size;
        header.file_size += size;
        offset
    }

    pub fn header(&self) -> FileHeader {
        *self.header.lock().unwrap()
    }

    /// 更新缓存并持久化文件头
    pub fn write_header(&self, new: FileHeader) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        *header = new;
        let file = self.file.read().unwrap();
        file.write_all_at(&new.encode(), 0)?;
        file.sync_data()?;
        Ok(())
    }

    /// 记录新的 last_id 并落盘文件头
    pub fn commit_header(&self, last_id: i32) -> Result<()> {
        let snapshot = {
            let mut header = self.header.lock().unwrap();
            if last_id > header.last_id {
                header.last_id = last_id;
            }
            *header
        };
        let file = self.file.read().unwrap();
        file.write_all_at(&snapshot.encode(), 0)?;
        file.sync_data()?;
        Ok(())
    }

    /// 压缩成功后用临时文件原子替换数据文件并换句柄
    pub fn swap_file(&self, temp: &Path, new_header: FileHeader) -> Result<()> {
        let mut file = self.file.write().unwrap();
        std::fs::rename(temp, &self.path)?;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *self.header.lock().unwrap() = new_header;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::record::{self, Record};
    use tempfile::TempDir;

    fn open_in(dir: &TempDir) -> (FileManager, bool, bool) {
        FileManager::open(dir.path().join("store.db"), 256, 16, true).unwrap()
    }

    #[test]
    fn create_and_reopen_test() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (fm, created, unclean) = open_in(&dir);
            assert!(created);
            assert!(!unclean);
            assert_eq!(fm.header().file_size, HEADER_SIZE);
        }
        let (fm, created, unclean) = open_in(&dir);
        assert!(!created);
        assert!(!unclean);
        assert_eq!(fm.header().last_id, 0);
        Ok(())
    }

    #[test]
    fn slot_roundtrip_test() -> Result<()> {
        let dir = TempDir::new()?;
        let (fm, _, _) = open_in(&dir);
        let rec = Record::new(5, "Aqua", "Oceanic", 500, 3);
        let slot = record::encoded_len(&rec);
        let bytes = record::serialize(&rec, slot)?;

        let offset = fm.append_reserve(slot as u64);
        assert_eq!(offset, HEADER_SIZE);
        fm.write_slot(offset, &bytes)?;

        let mut buf = Vec::new();
        let n = fm.read_slot(offset, &mut buf)?;
        assert_eq!(n, slot);
        assert!(record::validate_checksum(&buf));
        assert_eq!(record::deserialize(&buf)?, rec);
        Ok(())
    }

    #[test]
    fn out_of_bounds_test() -> Result<()> {
        let dir = TempDir::new()?;
        let (fm, _, _) = open_in(&dir);
        let mut buf = Vec::new();
        let err = fm.read_slot(HEADER_SIZE, &mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::OutOfBounds { .. })
        ));
        // 头部区域同样越界
        assert!(fm.read_slot(0, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn unclean_detection_test() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (fm, _, _) = open_in(&dir);
            let mut h = fm.header();
            h.valid = false;
            fm.write_header(h)?;
        }
        let (_, created, unclean) = open_in(&dir);
        assert!(!created);
        assert!(unclean);
        Ok(())
    }
}
