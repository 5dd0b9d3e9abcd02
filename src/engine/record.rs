//! record 数据模型与 slot 编码
//!
//! slot 布局（整数一律大端）：
//! `[checksum u64][slot_len i32][id i32][name_len i32][name][brand_len i32][brand]`
//! `[price i32][stock i32][active u8][version u32][补零到 slot_len]`
//!
//! checksum 覆盖 checksum 字段之后的所有字节，即 `[8..slot_len)`

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::common::error_enum::StoreError;
use crate::common::fn_util::checksum_u64;
use crate::common::types::ByteVec;

/// checksum 字段长度
pub const CHECKSUM_SIZE: usize = 8;
/// checksum + slot_len 组成的定长前缀
pub const SLOT_PREFIX_SIZE: usize = 12;
/// 空字符串 record 的编码长度，也是 slot 的下限与分裂阈值
pub const RECORD_MIN_LEN: usize = SLOT_PREFIX_SIZE + 4 + 4 + 4 + 4 + 4 + 1 + 4;
/// name 字段编码后的字节上限，超出部分截断
pub const NAME_MAX_BYTES: usize = 80;
/// brand 字段编码后的字节上限
pub const BRAND_MAX_BYTES: usize = 48;

/// 存储的完整实体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: i32,
    pub name: String,
    pub brand: String,
    /// 价格（最小货币单位）
    pub price: i32,
    pub stock: i32,
    /// 软删除标志
    pub active: bool,
    /// 每次成功变更 +1
    pub version: u32,
}

impl Record {
    pub fn new(id: i32, name: &str, brand: &str, price: i32, stock: i32) -> Self {
        Record {
            id,
            name: name.to_string(),
            brand: brand.to_string(),
            price,
            stock,
            active: true,
            version: 1,
        }
    }

    /// 占位 slot（分裂剩余空间、搬迁后的旧 slot），永远不会被索引
    fn hole() -> Self {
        Record {
            id: 0,
            name: String::new(),
            brand: String::new(),
            price: 0,
            stock: 0,
            active: false,
            version: 0,
        }
    }
}

/// name/brand 在进出磁盘边界处可插拔的文本变换
///
/// 引擎只假设 `decode(encode(x)) == x`，且变换不改变字段的字节上限约定
pub trait RecordCodec: Send + Sync {
    fn encode(&self, text: &str) -> String;
    fn decode(&self, text: &str) -> String;
}

/// 默认的恒等变换
pub struct PlainCodec;

impl RecordCodec for PlainCodec {
    fn encode(&self, text: &str) -> String {
        text.to_string()
    }
    fn decode(&self, text: &str) -> String {
        text.to_string()
    }
}

/// 字段校验；校验失败不会产生 WAL 条目
pub fn validate_fields(rec: &Record) -> Result<()> {
    if rec.id <= 0 {
        return Err(anyhow::Error::from(StoreError::Validation(format!(
            "id must be positive, got {}",
            rec.id
        ))));
    }
    if rec.name.trim().is_empty() {
        return Err(anyhow::Error::from(StoreError::Validation(
            "name must not be empty".to_string(),
        )));
    }
    if rec.price < 1 {
        return Err(anyhow::Error::from(StoreError::Validation(format!(
            "price must be at least 1, got {}",
            rec.price
        ))));
    }
    if rec.stock < 0 {
        return Err(anyhow::Error::from(StoreError::Validation(format!(
            "stock must not be negative, got {}",
            rec.stock
        ))));
    }
    Ok(())
}

/// 按 utf-8 边界截断到 cap 字节以内
fn truncate_utf8(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// 截断后的编码长度（不含 slot 内的补零）
pub fn encoded_len(rec: &Record) -> usize {
    RECORD_MIN_LEN
        + truncate_utf8(&rec.name, NAME_MAX_BYTES).len()
        + truncate_utf8(&rec.brand, BRAND_MAX_BYTES).len()
}

/// 序列化到一个完整的 slot，返回 slot_len 字节
pub fn serialize(rec: &Record, slot_len: usize) -> Result<ByteVec> {
    let name_bytes = truncate_utf8(&rec.name, NAME_MAX_BYTES).as_bytes();
    let brand_bytes = truncate_utf8(&rec.brand, BRAND_MAX_BYTES).as_bytes();
    let content_len = RECORD_MIN_LEN + name_bytes.len() + brand_bytes.len();
    if content_len > slot_len || slot_len > i32::MAX as usize {
        return Err(anyhow::Error::from(StoreError::Capacity {
            size: content_len as u32,
            max: slot_len as u32,
        }));
    }

    let mut buf = vec![0_u8; slot_len];
    {
        let mut cur = Cursor::new(&mut buf[..]);
        cur.set_position(CHECKSUM_SIZE as u64);
        cur.write_i32::<BigEndian>(slot_len as i32)?;
        cur.write_i32::<BigEndian>(rec.id)?;
        cur.write_i32::<BigEndian>(name_bytes.len() as i32)?;
        cur.write_all(name_bytes)?;
        cur.write_i32::<BigEndian>(brand_bytes.len() as i32)?;
        cur.write_all(brand_bytes)?;
        cur.write_i32::<BigEndian>(rec.price)?;
        cur.write_i32::<BigEndian>(rec.stock)?;
        cur.write_u8(rec.active as u8)?;
        cur.write_u32::<BigEndian>(rec.version)?;
    }
    let sum = checksum_u64(&buf[CHECKSUM_SIZE..]);
    BigEndian::write_u64(&mut buf[..CHECKSUM_SIZE], sum);
    Ok(buf)
}

/// 生成覆盖给定区域的占位 slot
pub fn hole_slot(slot_len: usize) -> Result<ByteVec> {
    serialize(&Record::hole(), slot_len)
}

/// 重算 checksum 并与存储值比较；不匹配视为损坏
pub fn validate_checksum(bytes: &[u8]) -> bool {
    if bytes.len() < RECORD_MIN_LEN {
        return false;
    }
    let saved = BigEndian::read_u64(&bytes[..CHECKSUM_SIZE]);
    checksum_u64(&bytes[CHECKSUM_SIZE..]) == saved
}

/// 从完整 slot 反序列化；调用方必须先通过 `validate_checksum`
pub fn deserialize(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < RECORD_MIN_LEN {
        anyhow::bail!("slot too short: {} bytes", bytes.len());
    }
    let mut cur = Cursor::new(bytes);
    cur.set_position(CHECKSUM_SIZE as u64);
    let slot_len = cur.read_i32::<BigEndian>()?;
    if slot_len as usize != bytes.len() {
        anyhow::bail!(
            "slot_len mismatch: stored {}, actual {}",
            slot_len,
            bytes.len()
        );
    }
    let id = cur.read_i32::<BigEndian>()?;

    let payload_cap = bytes.len() - RECORD_MIN_LEN;
    let name = read_string(&mut cur, payload_cap)?;
    let brand = read_string(&mut cur, payload_cap)?;

    let price = cur.read_i32::<BigEndian>()?;
    let stock = cur.read_i32::<BigEndian>()?;
    let active = cur.read_u8()? != 0;
    let version = cur.read_u32::<BigEndian>()?;

    Ok(Record {
        id,
        name,
        brand,
        price,
        stock,
        active,
        version,
    })
}

fn read_string(cur: &mut Cursor<&[u8]>, cap: usize) -> Result<String> {
    let len = cur.read_i32::<BigEndian>()?;
    if len < 0 || len as usize > cap {
        anyhow::bail!("invalid string length: {}", len);
    }
    let mut raw = vec![0_u8; len as usize];
    cur.read_exact(&mut raw)?;
    Ok(String::from_utf8(raw)?)
}
