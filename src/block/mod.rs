pub mod genesis;
pub mod header;

pub use header::{sha256d, BlockHash, BlockHeader, Hash256, HeaderDecodeError};
