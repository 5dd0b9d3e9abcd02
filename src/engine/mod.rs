//! 存储引擎入口
//!
//! `Store` 把各组件拼成单文件 record 存储：
//! B+Tree 索引、数据文件管理、空闲表、WAL、buffer pool 与批量线程池。
//!
//! 锁层级自外向内：引擎全局锁 -> 段锁/索引锁 -> 空闲表锁。
//! WAL 与空闲表自带内部锁，位于层级末端，持有期间不再申请上层锁

pub mod batch;
pub mod btree;
pub mod buffer_pool;
pub mod compact;
pub mod data_file;
pub mod free_space;
pub mod record;
pub mod recover;
pub mod wal;

pub use batch::{BatchHandle, BatchOutcome};

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::common::error_enum::StoreError;
use crate::common::fn_util::checksum_u64;
use crate::config::{StoreConfig, STORE_CONFIG};
use batch::BatchPool;
use btree::BPlusTree;
use compact::CompactStats;
use data_file::{FileManager, HEADER_SIZE};
use free_space::FreeSpaceList;
use record::{Record, RecordCodec};
use wal::{TransactionLog, TxOp, TxStatus};

/// 运行时指标快照
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub total_ops: u64,
    pub active_records: usize,
    pub file_size: u64,
    pub free_bytes: u64,
    /// 数据区中空闲字节的占比，[0, 1]
    pub fragmentation_ratio: f64,
    pub available_buffers: usize,
}

struct StoreInner {
    /// 读持有表示普通 CRUD 在进行，写持有表示压缩或关闭
    global: RwLock<()>,
    files: FileManager,
    index: RwLock<BPlusTree>,
    free: Mutex<FreeSpaceList>,
    wal: TransactionLog,
    buffers: buffer_pool::BufferPool,
    codec: Arc<dyn RecordCodec>,
    tx_seq: AtomicU64,
    op_count: AtomicU64,
    config: StoreConfig,
}

/// 单文件 record 存储引擎
pub struct Store {
    inner: Arc<StoreInner>,
    pool: Mutex<BatchPool>,
    closed: AtomicBool,
}

impl Store {
    /// 用全局配置与恒等 codec 打开
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        Store::open_with(path, STORE_CONFIG.clone(), Arc::new(record::PlainCodec))
    }

    pub fn open_with_codec<P: AsRef<Path>>(path: P, codec: Arc<dyn RecordCodec>) -> Result<Store> {
        Store::open_with(path, STORE_CONFIG.clone(), codec)
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        codec: Arc<dyn RecordCodec>,
    ) -> Result<Store> {
        let data_path = path.as_ref().to_path_buf();
        // 上次压缩若中断会留下临时文件，数据文件本体未被替换
        let leftover = sibling(&data_path, "compact");
        if leftover.exists() {
            warn!("removing leftover compaction temp file {:?}", leftover);
            std::fs::remove_file(&leftover)?;
        }

        let (files, created, unclean) = FileManager::open(
            &data_path,
            config.max_record_size,
            config.segment_count,
            config.sync_writes,
        )?;
        let wal = TransactionLog::open(sibling(&data_path, "wal"))?;
        let mut free = FreeSpaceList::load(
            sibling(&data_path, "flist"),
            data_file::DATA_START_OFFSET,
            record::RECORD_MIN_LEN as u32,
        )?;
        if unclean {
            // 崩溃后侧文件不可信，空闲表完全由扫描重建
            free.clear()?;
        }

        let mut index = BPlusTree::new(config.order);
        let report = recover::rebuild_index(&files, &mut index, &mut free)?;
        if !wal.is_empty()? {
            recover::replay_wal(&files, &mut index, &mut free, &wal)?;
        }

        let mut header = files.header();
        header.last_id = header.last_id.max(report.max_id);
        header.file_size = files.actual_len()?;
        // 打开即压成 false，干净 close 时写回 true
        header.valid = false;
        files.write_header(header)?;

        let buffers =
            buffer_pool::BufferPool::new(config.buffer_pool_capacity, files.max_slot() as usize);
        let pool = BatchPool::new(config.effective_batch_workers())?;

        let inner = Arc::new(StoreInner {
            global: RwLock::new(()),
            files,
            index: RwLock::new(index),
            free: Mutex::new(free),
            wal,
            buffers,
            codec,
            tx_seq: AtomicU64::new(1),
            op_count: AtomicU64::new(0),
            config,
        });

        if unclean && !created {
            info!("forcing compaction after crash recovery");
            let _g = inner.global.write().unwrap();
            let mut index = inner.index.write().unwrap();
            let mut free = inner.free.lock().unwrap();
            let tx_id = inner.tx_seq.fetch_add(1, Ordering::SeqCst);
            compact::run_compaction(&inner.files, &mut index, &mut free, &inner.wal, tx_id, None)?;
        }

        info!(
            "store opened: {:?}, {} record(s), created={}, unclean={}",
            data_path, report.live, created, unclean
        );
        Ok(Store {
            inner,
            pool: Mutex::new(pool),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("store is closed");
        }
        Ok(())
    }

    /// 写入一条新 record，id 重复返回 Validation 错误
    pub fn create(&self, rec: &Record) -> Result<()> {
        self.ensure_open()?;
        let tx_id = self.inner.next_tx();
        self.inner.create_record(rec, tx_id, TxOp::Create)
    }

    /// 按 id 读取；不存在或 slot 损坏返回 None，损坏会记入日志
    pub fn read(&self, id: i32) -> Result<Option<Record>> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _g = inner.global.read().unwrap();
        let offset = match inner.index.read().unwrap().lookup(id) {
            Some(o) => o,
            None => return Ok(None),
        };
        let mut buf = inner.buffers.acquire();
        if let Err(e) = inner.files.read_slot(offset, &mut buf) {
            error!("record {} unreadable at offset {}: {}", id, offset, e);
            return Ok(None);
        }
        if !record::validate_checksum(&buf) {
            error!("record {} at offset {} failed checksum", id, offset);
            return Ok(None);
        }
        let rec = record::deserialize(&buf)?;
        if rec.id != id || !rec.active {
            warn!("index points to stale slot for record {}", id);
            return Ok(None);
        }
        inner.op_count.fetch_add(1, Ordering::Relaxed);
        Ok(Some(inner.decode_record(rec)))
    }

    /// 整条替换，version 自增；原 slot 放不下时搬迁到新位置
    pub fn update(&self, rec: &Record) -> Result<()> {
        self.ensure_open()?;
        record::validate_fields(rec)?;
        let inner = &self.inner;
        let _g = inner.global.read().unwrap();

        let old_offset = inner
            .index
            .read()
            .unwrap()
            .lookup(rec.id)
            .ok_or(StoreError::NotFound(rec.id))?;
        let mut before = Vec::with_capacity(inner.files.max_slot() as usize);
        let slot_len = inner.files.read_slot(old_offset, &mut before)?;
        verify_slot(&before, old_offset)?;
        let old_rec = record::deserialize(&before)?;
        // 并发 delete 可能刚盖完墓碑，墓碑的 checksum 是合法的
        if old_rec.id != rec.id || !old_rec.active {
            return Err(StoreError::NotFound(rec.id).into());
        }

        let mut stored = inner.encode_record(rec);
        stored.active = true;
        stored.version = old_rec.version + 1;
        let need = record::encoded_len(&stored) as u32;
        inner.check_capacity(need)?;

        let tx_id = inner.next_tx();
        if need as usize <= slot_len {
            // 原地覆盖
            let after = record::serialize(&stored, slot_len)?;
            inner
                .wal
                .log(TxOp::Update, tx_id, rec.id, before, after.clone(), TxStatus::Pending)?;
            if let Err(e) = inner.files.write_slot(old_offset, &after) {
                inner.wal.terminate(TxOp::Update, tx_id, rec.id, TxStatus::Rollback)?;
                return Err(e);
            }
            // 提交前在索引写锁下裁决：旧 slot 已经易主说明输给了并发 delete/搬迁，
            // 盖洞撤掉刚写进去的活动内容（块已被赢家归还，这里不再归还）
            let owned = inner.index.write().unwrap().lookup(rec.id) == Some(old_offset);
            if !owned {
                inner
                    .files
                    .write_slot(old_offset, &record::hole_slot(slot_len)?)?;
                inner.wal.terminate(TxOp::Update, tx_id, rec.id, TxStatus::Rollback)?;
                return Err(StoreError::NotFound(rec.id).into());
            }
        } else {
            // 搬迁：新位置写好后切索引，旧 slot 盖洞归还
            let (new_offset, new_len) = inner.allocate_slot(need)?;
            let after = record::serialize(&stored, new_len as usize)?;
            inner
                .wal
                .log(TxOp::Update, tx_id, rec.id, before, after.clone(), TxStatus::Pending)?;
            if let Err(e) = inner.files.write_slot(new_offset, &after) {
                inner.release_slot(new_offset, new_len)?;
                inner.wal.terminate(TxOp::Update, tx_id, rec.id, TxStatus::Rollback)?;
                return Err(e);
            }
            // 切换失败说明索引条目已被并发 delete/搬迁改走，新 slot 作废
            let switched = inner
                .index
                .write()
                .unwrap()
                .update_offset(rec.id, old_offset, new_offset);
            if !switched {
                inner
                    .files
                    .write_slot(new_offset, &record::hole_slot(new_len as usize)?)?;
                inner.release_slot(new_offset, new_len)?;
                inner.wal.terminate(TxOp::Update, tx_id, rec.id, TxStatus::Rollback)?;
                return Err(StoreError::NotFound(rec.id).into());
            }
            inner
                .files
                .write_slot(old_offset, &record::hole_slot(slot_len)?)?;
            inner
                .free
                .lock()
                .unwrap()
                .add_free_block(old_offset, slot_len as u32)?;
        }
        inner.wal.terminate(TxOp::Update, tx_id, rec.id, TxStatus::Commit)?;
        inner.op_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 软删除：slot 原地盖成墓碑，空间立即归入空闲表
    pub fn delete(&self, id: i32) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _g = inner.global.read().unwrap();

        let offset = inner
            .index
            .read()
            .unwrap()
            .lookup(id)
            .ok_or(StoreError::NotFound(id))?;
        let mut before = Vec::with_capacity(inner.files.max_slot() as usize);
        let slot_len = inner.files.read_slot(offset, &mut before)?;
        verify_slot(&before, offset)?;
        let old_rec = record::deserialize(&before)?;

        let mut tomb = old_rec;
        tomb.active = false;
        tomb.version += 1;
        let after = record::serialize(&tomb, slot_len)?;

        let tx_id = inner.next_tx();
        inner
            .wal
            .log(TxOp::Delete, tx_id, id, before, after.clone(), TxStatus::Pending)?;
        if let Err(e) = inner.files.write_slot(offset, &after) {
            inner.wal.terminate(TxOp::Delete, tx_id, id, TxStatus::Rollback)?;
            return Err(e);
        }
        {
            // 索引写锁下裁决：条目已被并发 update 搬走则旧 slot 不归我们管
            let mut index = inner.index.write().unwrap();
            if index.lookup(id) != Some(offset) {
                drop(index);
                inner.wal.terminate(TxOp::Delete, tx_id, id, TxStatus::Rollback)?;
                return Err(StoreError::NotFound(id).into());
            }
            index.delete(id);
        }
        // 摘掉索引后重写一遍墓碑，压掉裁决前挤进来的原地 update 内容
        inner.files.write_slot(offset, &after)?;
        inner
            .free
            .lock()
            .unwrap()
            .add_free_block(offset, slot_len as u32)?;
        inner.wal.terminate(TxOp::Delete, tx_id, id, TxStatus::Commit)?;
        inner.op_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 把一批 create 交给 worker pool，逐条落盘，逐条出结果
    pub fn batch_create(&self, recs: Vec<Record>) -> Result<BatchHandle> {
        self.ensure_open()?;
        let inner = self.inner.clone();
        let tx_id = inner.next_tx();
        inner
            .wal
            .log(TxOp::BatchStart, tx_id, 0, Vec::new(), Vec::new(), TxStatus::Pending)?;
        self.pool.lock().unwrap().submit(move || {
            let mut outcomes = Vec::with_capacity(recs.len());
            for rec in &recs {
                match inner.create_record(rec, tx_id, TxOp::BatchItemCreate) {
                    Ok(()) => outcomes.push(BatchOutcome {
                        id: rec.id,
                        error: None,
                    }),
                    Err(e) => {
                        let _ = inner.wal.terminate(
                            TxOp::BatchItemFail,
                            tx_id,
                            rec.id,
                            TxStatus::Rollback,
                        );
                        outcomes.push(BatchOutcome {
                            id: rec.id,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
            if let Err(e) = inner
                .wal
                .terminate(TxOp::BatchCommit, tx_id, 0, TxStatus::Commit)
            {
                error!("batch {} commit marker failed: {}", tx_id, e);
            }
            outcomes
        })
    }

    /// 返回 id 落在 [lo, hi] 内的存活 record，按 id 升序；
    /// 损坏的 slot 记日志后跳过
    pub fn scan_range(&self, lo: i32, hi: i32) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _g = inner.global.read().unwrap();
        let offsets = inner.index.read().unwrap().range(lo, hi);

        let mut out = Vec::with_capacity(offsets.len());
        let mut buf = inner.buffers.acquire();
        for offset in offsets {
            if inner.files.read_slot(offset, &mut buf).is_err()
                || !record::validate_checksum(&buf)
            {
                error!("skipping unreadable slot at offset {} during scan", offset);
                continue;
            }
            let rec = record::deserialize(&buf)?;
            if rec.active {
                out.push(inner.decode_record(rec));
            }
        }
        inner.op_count.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// 原地压缩，执行期间独占引擎
    pub fn compact(&self) -> Result<CompactStats> {
        self.ensure_open()?;
        self.inner.compact_with(None)
    }

    /// 把紧凑副本导出到 target，原文件不变
    pub fn export_compact(&self, target: &Path) -> Result<CompactStats> {
        self.ensure_open()?;
        self.inner.compact_with(Some(target))
    }

    /// 当前索引里全部存活 id，升序
    pub fn all_ids(&self) -> Result<Vec<i32>> {
        self.ensure_open()?;
        let _g = self.inner.global.read().unwrap();
        Ok(self.inner.index.read().unwrap().all_ids())
    }

    pub fn stats(&self) -> Result<Stats> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _g = inner.global.read().unwrap();
        let file_size = inner.files.actual_len()?;
        let free_bytes = inner.free.lock().unwrap().free_bytes();
        let data_bytes = file_size.saturating_sub(HEADER_SIZE);
        Ok(Stats {
            total_ops: inner.op_count.load(Ordering::Relaxed),
            active_records: inner.index.read().unwrap().len(),
            file_size,
            free_bytes,
            fragmentation_ratio: if data_bytes == 0 {
                0.0
            } else {
                free_bytes as f64 / data_bytes as f64
            },
            available_buffers: inner.buffers.available(),
        })
    }

    /// 排空 worker pool、持久化空闲表并把文件头标回干净。
    /// 排空超时仍然落盘元数据，之后才返回 DeadlineExceeded
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.inner.config.close_timeout_secs);
        let drain = self.pool.lock().unwrap().close(timeout);

        let inner = &self.inner;
        let _g = inner.global.write().unwrap();
        inner.free.lock().unwrap().persist()?;
        inner.wal.clear()?;
        let mut header = inner.files.header();
        header.valid = true;
        header.file_size = inner.files.actual_len()?;
        inner.files.write_header(header)?;
        info!("store closed");
        drain
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                error!("close on drop failed: {}", e);
            }
        }
    }
}

impl StoreInner {
    fn next_tx(&self) -> u64 {
        self.tx_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn encode_record(&self, rec: &Record) -> Record {
        let mut out = rec.clone();
        out.name = self.codec.encode(&rec.name);
        out.brand = self.codec.encode(&rec.brand);
        out
    }

    fn decode_record(&self, mut rec: Record) -> Record {
        rec.name = self.codec.decode(&rec.name);
        rec.brand = self.codec.decode(&rec.brand);
        rec
    }

    fn check_capacity(&self, need: u32) -> Result<()> {
        if need > self.config.max_record_size {
            return Err(StoreError::Capacity {
                size: need,
                max: self.config.max_record_size,
            }
            .into());
        }
        Ok(())
    }

    /// 先吃空闲表（first-fit，分裂出的剩余块盖占位洞），
    /// 没有合适的块则从文件尾追加
    fn allocate_slot(&self, need: u32) -> Result<(u64, u32)> {
        let grant = self.free.lock().unwrap().get_free_block(need)?;
        if let Some((block, remainder)) = grant {
            if let Some(rem) = remainder {
                // 剩余块还没有进索引，不需要段锁
                self.files
                    .write_slot_raw(rem.offset, &record::hole_slot(rem.size as usize)?)?;
            }
            return Ok((block.offset, block.size));
        }
        Ok((self.files.append_reserve(need as u64), need))
    }

    fn release_slot(&self, offset: u64, size: u32) -> Result<()> {
        self.free.lock().unwrap().add_free_block(offset, size)
    }

    fn create_record(&self, rec: &Record, tx_id: u64, op: TxOp) -> Result<()> {
        record::validate_fields(rec)?;
        let _g = self.global.read().unwrap();
        if self.index.read().unwrap().contains(rec.id) {
            return Err(
                StoreError::Validation(format!("record {} already exists", rec.id)).into(),
            );
        }
        let stored = self.encode_record(rec);
        let need = record::encoded_len(&stored) as u32;
        self.check_capacity(need)?;

        let (offset, slot_len) = self.allocate_slot(need)?;
        let bytes = record::serialize(&stored, slot_len as usize)?;
        self.wal
            .log(op, tx_id, rec.id, Vec::new(), bytes.clone(), TxStatus::Pending)?;
        if let Err(e) = self.files.write_slot(offset, &bytes) {
            self.release_slot(offset, slot_len)?;
            self.wal.terminate(op, tx_id, rec.id, TxStatus::Rollback)?;
            return Err(e);
        }
        {
            // 并发 create 撞号在插入时裁决，输家回滚
            let mut index = self.index.write().unwrap();
            if index.contains(rec.id) {
                drop(index);
                self.files
                    .write_slot(offset, &record::hole_slot(slot_len as usize)?)?;
                self.release_slot(offset, slot_len)?;
                self.wal.terminate(op, tx_id, rec.id, TxStatus::Rollback)?;
                return Err(
                    StoreError::Validation(format!("record {} already exists", rec.id)).into(),
                );
            }
            index.insert(rec.id, offset)?;
        }
        self.wal.terminate(op, tx_id, rec.id, TxStatus::Commit)?;
        self.files.commit_header(rec.id)?;
        self.op_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn compact_with(&self, target: Option<&Path>) -> Result<CompactStats> {
        let _g = self.global.write().unwrap();
        let mut index = self.index.write().unwrap();
        let mut free = self.free.lock().unwrap();
        let tx_id = self.next_tx();
        compact::run_compaction(&self.files, &mut index, &mut free, &self.wal, tx_id, target)
    }
}

/// 数据文件的伴生侧文件路径，如 `store.db` -> `store.db.wal`
fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// checksum 校验失败转成带现场的 DataCorruption
fn verify_slot(bytes: &[u8], offset: u64) -> Result<()> {
    if record::validate_checksum(bytes) {
        return Ok(());
    }
    let saved = BigEndian::read_u64(&bytes[0..record::CHECKSUM_SIZE]);
    Err(StoreError::DataCorruption {
        offset,
        checksum: checksum_u64(&bytes[record::CHECKSUM_SIZE..]),
        saved_checksum: saved,
    }
    .into())
}
