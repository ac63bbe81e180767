//! Header-chain and synchronizer error types
//!
//! `ChainError` covers the local store (file + in-memory index);
//! `SyncError` adds the failure modes of driving that store from a server.

use crate::network::client::ClientError;
use thiserror::Error;

/// Errors raised by the header chain store
#[derive(Error, Debug)]
pub enum ChainError {
    /// Byte length is not a whole number of headers
    #[error("corrupt length: {len} bytes is not a multiple of header size {header_size}")]
    CorruptLength { len: u64, header_size: usize },

    /// A record could not be decoded
    #[error("failed to deserialize header at height {height}: {reason}")]
    Deserialize { height: u64, reason: String },

    /// Linkage break: `headers[height].prev != hash(headers[height - 1])`
    #[error("chain verification failed at height {height}")]
    ChainVerifyFailed { height: u64 },

    /// A header expected in the index is missing
    #[error("header not found at height {0}")]
    NotFound(u64),

    /// Requested range falls outside `[start_point, tip]`
    #[error("invalid header range: start {start}, count {count} (start point {start_point}, tip {tip:?})")]
    Range {
        start: u64,
        count: u64,
        start_point: u64,
        tip: Option<u64>,
    },

    /// Truncation request that cannot be honoured
    #[error("invalid truncate: {0}")]
    InvalidTruncate(String),

    /// Truncation during bulk catch-up is forbidden
    #[error("cannot truncate the header file before initial sync has completed")]
    TruncateBeforeSync,

    #[error("header file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    /// True for errors that mean the persisted chain cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChainError::CorruptLength { .. }
                | ChainError::Deserialize { .. }
                | ChainError::ChainVerifyFailed { .. }
        )
    }
}

/// Errors raised by the header synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Reorg rewind reached the checkpoint without reconnecting
    #[error("reorg recovery exhausted: tip {tip:?} is within rewind distance of start point {start_point}")]
    Exhausted { tip: Option<u64>, start_point: u64 },

    /// Server notified a tip below our trusted checkpoint
    #[error("server misbehaving: notified height {height} is below start point {start_point}")]
    Misbehaving { height: u64, start_point: u64 },

    /// `blockchain.block.headers` reply disagrees with the request
    #[error("header batch mismatch at {start}: requested {requested}, server reported count {count} with {bytes} bytes")]
    BatchMismatch {
        start: u64,
        requested: usize,
        count: usize,
        bytes: usize,
    },

    /// Header hex in a batch or single-header reply does not decode
    #[error("malformed header data at {start}: {reason}")]
    MalformedHeaders { start: u64, reason: String },

    /// Subscribe response behind the local tip with the `disconnect` policy
    #[error("stale subscribe response: server tip {server} behind local tip {local}")]
    StaleSubscribe { server: u64, local: u64 },

    #[error("notification header is malformed: {0}")]
    BadNotification(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Fatal errors stop the notification worker.
    ///
    /// Non-fatal errors (a server-side RPC error, a bad batch, a malformed
    /// notification) are logged and the worker waits for the next tip.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Client(e) => e.is_connection_fatal(),
            SyncError::Chain(_) => true,
            SyncError::Exhausted { .. } => true,
            SyncError::Misbehaving { .. } => true,
            SyncError::StaleSubscribe { .. } => true,
            SyncError::BatchMismatch { .. } => false,
            SyncError::MalformedHeaders { .. } => false,
            SyncError::BadNotification(_) => false,
        }
    }

    /// Conditions that need an operator, never an automatic retry
    pub fn is_chain_fatal(&self) -> bool {
        match self {
            SyncError::Exhausted { .. } => true,
            SyncError::Chain(e) => e.is_corruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let exhausted = SyncError::Exhausted {
            tip: Some(3),
            start_point: 0,
        };
        assert!(exhausted.is_fatal());
        assert!(exhausted.is_chain_fatal());

        let mismatch = SyncError::BatchMismatch {
            start: 10,
            requested: 20,
            count: 21,
            bytes: 1680,
        };
        assert!(!mismatch.is_fatal());

        let verify = SyncError::Chain(ChainError::ChainVerifyFailed { height: 7 });
        assert!(verify.is_chain_fatal());

        let rpc = SyncError::Client(ClientError::Rpc {
            code: -101,
            message: "excessive resource usage".to_string(),
        });
        assert!(!rpc.is_fatal());
        assert!(SyncError::Client(ClientError::Closed).is_fatal());
    }
}
