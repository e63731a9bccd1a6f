//! Error types for the operations crate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    /// Every problem found, one per line.
    #[error("config validation failed:\n{}", .0.join("\n"))]
    ValidationFailed(Vec<String>),

    /// A network named on the command line is not in the config file.
    #[error("network '{0}' is not configured")]
    UnknownNetwork(String),
}

/// Pre-flight failures. Each names the directory or network at fault.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("storage directory {}: {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },

    #[error("database for network '{network}' at {}: {reason}", .path.display())]
    Database {
        network: String,
        path: PathBuf,
        reason: String,
    },

    #[error("no enabled networks")]
    NoEnabledNetworks,

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

impl StartupError {
    pub(crate) fn storage(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Components that were abandoned after overrunning their timeout.
    #[error("{} component(s) did not stop in time: {}", .0.len(), .0.join(", "))]
    Incomplete(Vec<String>),
}
