//! Bitcoin-family block headers as served by ElectrumX.
//!
//! A header is kept as its exact serialized bytes so that the on-disk file,
//! the wire hex and the hash input are always the same byte string. The
//! fixed 80-byte Bitcoin prefix is decoded on demand.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the common Bitcoin header prefix (version .. nonce).
pub const BASE_HEADER_LEN: usize = 80;

pub type Hash256 = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeaderDecodeError {
    #[error("header is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("header size {0} is smaller than the {BASE_HEADER_LEN}-byte base header")]
    SizeTooSmall(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Block hash in internal byte order. Displays byte-reversed, as servers
/// and explorers print it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockHash(pub Hash256);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn from_display_hex(s: &str) -> Result<Self, HeaderDecodeError> {
        let mut bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(HeaderDecodeError::WrongLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }

    pub fn to_display_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_display_hex())
    }
}

impl FromStr for BlockHash {
    type Err = HeaderDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockHash::from_display_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_display_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_display_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An immutable serialized block header.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockHeader {
    raw: Box<[u8]>,
}

impl BlockHeader {
    /// Build a plain 80-byte Bitcoin header from its fields.
    pub fn new(
        version: i32,
        prev_blockhash: BlockHash,
        merkle_root: Hash256,
        time: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        let mut raw = Vec::with_capacity(BASE_HEADER_LEN);
        raw.extend_from_slice(&version.to_le_bytes());
        raw.extend_from_slice(&prev_blockhash.0);
        raw.extend_from_slice(&merkle_root);
        raw.extend_from_slice(&time.to_le_bytes());
        raw.extend_from_slice(&bits.to_le_bytes());
        raw.extend_from_slice(&nonce.to_le_bytes());
        Self {
            raw: raw.into_boxed_slice(),
        }
    }

    /// Decode one record of exactly `header_size` bytes.
    pub fn from_bytes(bytes: &[u8], header_size: usize) -> Result<Self, HeaderDecodeError> {
        if header_size < BASE_HEADER_LEN {
            return Err(HeaderDecodeError::SizeTooSmall(header_size));
        }
        if bytes.len() != header_size {
            return Err(HeaderDecodeError::WrongLength {
                expected: header_size,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            raw: bytes.to_vec().into_boxed_slice(),
        })
    }

    pub fn from_hex(s: &str, header_size: usize) -> Result<Self, HeaderDecodeError> {
        let bytes = hex::decode(s.trim())?;
        Self::from_bytes(&bytes, header_size)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.raw)
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash(sha256d(&self.raw))
    }

    pub fn version(&self) -> i32 {
        i32::from_le_bytes(self.le_word(0))
    }

    pub fn prev_blockhash(&self) -> BlockHash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.raw[4..36]);
        BlockHash(out)
    }

    pub fn merkle_root(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.raw[36..68]);
        out
    }

    pub fn time(&self) -> u32 {
        u32::from_le_bytes(self.le_word(68))
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.le_word(72))
    }

    pub fn nonce(&self) -> u32 {
        u32::from_le_bytes(self.le_word(76))
    }

    fn le_word(&self, offset: usize) -> [u8; 4] {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.raw[offset..offset + 4]);
        word
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("hash", &self.block_hash())
            .field("prev", &self.prev_blockhash())
            .field("time", &self.time())
            .finish()
    }
}

/// Split a concatenation of serialized headers into records.
pub fn split_headers(
    raw: &[u8],
    header_size: usize,
) -> impl Iterator<Item = Result<BlockHeader, HeaderDecodeError>> + '_ {
    raw.chunks(header_size)
        .map(move |chunk| BlockHeader::from_bytes(chunk, header_size))
}
