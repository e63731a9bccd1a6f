//! Configuration loading and validation.
//!
//! This module provides:
//! - Configuration types with serde support
//! - YAML file loading
//! - Fail-fast validation that collects all errors

mod loader;
pub mod types;
mod validation;

pub use loader::{load_config, load_config_from_str, read_config};
pub use types::{
    CacheSettings, DecoderConfig, IndexerConfig, NetworkConfig, ObservabilityConfig,
    OperationsConfig, PhaseConfig, StorageConfig, SyncConfig,
};
pub use validation::validate_config;
