//! Sample buffering and run export.

pub mod buffer;
pub mod storage;
