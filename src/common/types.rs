//! 公共类型别名

pub type ByteVec = Vec<u8>;
