use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Argument decode error: {0}")]
    ArgumentDecode(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Whether retrying the same request may succeed.
    /// Only transport-level failures are worth another attempt; decode and
    /// configuration errors are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::Rpc(_) | ScanError::Database(_))
    }
}

impl From<RpcError<TransportErrorKind>> for ScanError {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        ScanError::Rpc(err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Internal(err.to_string())
    }
}
