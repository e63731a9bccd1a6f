//! Error types for the transaction log and derived aggregates.

use thiserror::Error;

/// Errors that can occur while persisting or deriving staking state.
#[derive(Debug, Error)]
pub enum ChainIndexError {
    /// Transaction not found in the log.
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// No phase statistics exist for the phase.
    #[error("phase not found: {0}")]
    PhaseNotFound(u32),

    /// Staker aggregate not found.
    #[error("staker aggregate not found: {0}")]
    StakerNotFound(String),

    /// Finality provider aggregate not found.
    #[error("finality provider aggregate not found: {0}")]
    FinalityProviderNotFound(String),

    /// A transaction was submitted for a phase that does not own it.
    #[error("transaction {tx_id} (phase {found}, height {height}) does not belong to phase {expected}")]
    PhaseMismatch {
        tx_id: String,
        expected: u32,
        found: u32,
        height: u64,
    },

    /// Phase already reached its terminal status.
    #[error("phase {0} is already completed")]
    PhaseAlreadyCompleted(u32),

    /// A running total would not fit in 64 bits.
    #[error("arithmetic overflow while updating {0}")]
    ArithmeticOverflow(&'static str),

    /// Phase table is malformed.
    #[error("invalid phase table: {0}")]
    InvalidPhaseTable(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// SQLite database error.
    #[error("sqlite error: {0}")]
    Sqlite(String),

    /// A cached computation failed.
    #[error("cache error: {0}")]
    Cache(String),
}

impl From<serde_json::Error> for ChainIndexError {
    fn from(err: serde_json::Error) -> Self {
        ChainIndexError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainIndexError {
    fn from(err: rusqlite::Error) -> Self {
        ChainIndexError::Sqlite(err.to_string())
    }
}

impl From<crate::cache::CacheError> for ChainIndexError {
    fn from(err: crate::cache::CacheError) -> Self {
        ChainIndexError::Cache(err.to_string())
    }
}

impl From<r2d2::Error> for ChainIndexError {
    fn from(err: r2d2::Error) -> Self {
        ChainIndexError::Sqlite(err.to_string())
    }
}

/// Result type for chain indexing operations.
pub type ChainIndexResult<T> = Result<T, ChainIndexError>;
