pub mod error_enum;
pub mod fn_util;
pub mod types;

pub use error_enum::StoreError;
pub use types::ByteVec;
