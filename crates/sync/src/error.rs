//! Error types for chain access, decoding and the sync pipeline.

use stakeidx_chain_index::ChainIndexError;
use thiserror::Error;

/// Failure reported by a [`ChainClient`](crate::client::ChainClient).
///
/// The kind drives recovery: pruned heights trigger the availability search,
/// transient failures are retried with backoff, fatal ones are not retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("height {height} is no longer available on the node")]
    Pruned { height: u64 },

    #[error("transient node error: {0}")]
    Transient(String),

    #[error("node error: {0}")]
    Fatal(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A raw transaction the decoder could not interpret.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("'{event}' event has no '{attribute}' attribute")]
    MissingAttribute {
        event: String,
        attribute: &'static str,
    },

    #[error("invalid amount '{0}'")]
    InvalidAmount(String),

    #[error("transaction {0} carries no block time")]
    MissingTimestamp(String),

    #[error("stake denominated in '{found}', expected '{expected}'")]
    UnexpectedDenom { found: String, expected: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Index(#[from] ChainIndexError),

    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    #[error("network '{0}' is already registered")]
    DuplicateNetwork(String),

    #[error("sync for network '{0}' is already running")]
    AlreadyRunning(String),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}
