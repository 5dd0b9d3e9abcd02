//! 配置文件解析
use anyhow::Result;
use lazy_static::lazy_static;
use serde_derive::Deserialize;
use std::env::current_dir;
use std::path::Path;

const STORE_CONFIG_FILE: &str = "store.yml";
const CONFIG_BASE_DIR: &str = "config";

// 加载全局 StoreConfig；没有配置文件时直接使用默认值
lazy_static! {
    pub static ref STORE_CONFIG: StoreConfig = StoreConfig::load().unwrap_or_default();
}

/// store.yml 解析类
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// B+Tree 的阶，最小为 2
    pub order: usize,
    /// 单条 record 编码后的最大长度，也是段哈希的单位
    pub max_record_size: u32,
    /// 段锁数量
    pub segment_count: usize,
    /// buffer pool 容量
    pub buffer_pool_capacity: usize,
    /// 批量操作 worker 数量，0 表示取 CPU 核数
    pub batch_workers: usize,
    /// close 时等待 worker pool 排空的秒数
    pub close_timeout_secs: u64,
    /// 每次写 record 后是否强制刷盘
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            order: 8,
            max_record_size: 256,
            segment_count: 16,
            buffer_pool_capacity: 64,
            batch_workers: 0,
            close_timeout_secs: 10,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// 读取 config/store.yml 并覆盖默认值；文件不存在时返回默认配置
    pub fn load() -> Result<Self> {
        let mut c = config::Config::new();
        let defaults = StoreConfig::default();
        c.set_default("order", defaults.order as i64)?;
        c.set_default("max_record_size", defaults.max_record_size as i64)?;
        c.set_default("segment_count", defaults.segment_count as i64)?;
        c.set_default("buffer_pool_capacity", defaults.buffer_pool_capacity as i64)?;
        c.set_default("batch_workers", defaults.batch_workers as i64)?;
        c.set_default("close_timeout_secs", defaults.close_timeout_secs as i64)?;
        c.set_default("sync_writes", defaults.sync_writes)?;

        let path = current_dir()?
            .join(CONFIG_BASE_DIR)
            .join(Path::new(STORE_CONFIG_FILE));
        if path.exists() {
            if let Some(file) = path.to_str() {
                c.merge(config::File::with_name(file))?;
            }
        }
        Ok(c.try_into()?)
    }

    /// 实际使用的 worker 数量
    pub fn effective_batch_workers(&self) -> usize {
        if self.batch_workers == 0 {
            num_cpus::get()
        } else {
            self.batch_workers
        }
    }
}
