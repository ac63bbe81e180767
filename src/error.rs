use thiserror::Error;

use crate::chain_error::{ChainError, SyncError};
use crate::config::ConfigError;
use crate::network::client::ClientError;
use crate::network::tls::TlsError;

/// How the supervisor should react to a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The connection went away; reconnect with backoff
    Connection,
    /// The server cannot be trusted (wrong network, misbehaving)
    Protocol,
    /// Local chain state needs an operator
    Chain,
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("header store error: {0}")]
    Chain(#[from] ChainError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("genesis mismatch: expected {expected}, server reports {actual}")]
    GenesisMismatch { expected: String, actual: String },

    #[error("canary transaction {txid} check failed: {reason}")]
    CanaryFailed { txid: String, reason: String },

    #[error("node is not connected")]
    NotConnected,

    #[error("node is already running")]
    AlreadyRunning,
}

pub type NodeResult<T> = Result<T, NodeError>;

impl NodeError {
    pub fn class(&self) -> FailureClass {
        match self {
            NodeError::Client(e) if e.is_connection_fatal() => FailureClass::Connection,
            NodeError::Client(_) => FailureClass::Protocol,
            NodeError::Sync(e) if e.is_chain_fatal() => FailureClass::Chain,
            NodeError::Sync(SyncError::Chain(_)) => FailureClass::Chain,
            NodeError::Sync(SyncError::Client(e)) if e.is_connection_fatal() => {
                FailureClass::Connection
            }
            NodeError::Sync(SyncError::StaleSubscribe { .. }) => FailureClass::Connection,
            // Non-fatal sync errors only escape bulk sync; a fresh
            // connection retries them
            NodeError::Sync(e) if !e.is_fatal() => FailureClass::Connection,
            NodeError::Sync(_) => FailureClass::Protocol,
            NodeError::Chain(_) => FailureClass::Chain,
            NodeError::Tls(_) => FailureClass::Protocol,
            NodeError::GenesisMismatch { .. } | NodeError::CanaryFailed { .. } => {
                FailureClass::Protocol
            }
            NodeError::NotConnected => FailureClass::Connection,
            NodeError::AlreadyRunning => FailureClass::Protocol,
        }
    }

    /// Whether the supervisor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Connection
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Reconnect attempts exhausted after {0} tries")]
    RetriesExhausted(u32),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            NodeError::Client(ClientError::Closed).class(),
            FailureClass::Connection
        );
        assert_eq!(
            NodeError::Sync(SyncError::Exhausted {
                tip: None,
                start_point: 0
            })
            .class(),
            FailureClass::Chain
        );
        assert_eq!(
            NodeError::Sync(SyncError::Misbehaving {
                height: 1,
                start_point: 5
            })
            .class(),
            FailureClass::Protocol
        );
        assert_eq!(
            NodeError::Sync(SyncError::Chain(ChainError::ChainVerifyFailed { height: 3 })).class(),
            FailureClass::Chain
        );
        assert_eq!(
            NodeError::Sync(SyncError::StaleSubscribe { server: 1, local: 2 }).class(),
            FailureClass::Connection
        );
        assert!(NodeError::Sync(SyncError::Client(ClientError::Io(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe
        ))))
        .is_retryable());
        assert!(!NodeError::GenesisMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }
}
