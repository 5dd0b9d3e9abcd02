pub mod common;
pub mod config;
mod engine;

pub use common::error_enum::StoreError;
pub use engine::compact::CompactStats;
pub use engine::record::{PlainCodec, Record, RecordCodec};
pub use engine::{BatchHandle, BatchOutcome, Stats, Store};
