//! Operations infrastructure for the staking indexer.
//!
//! - **Config**: YAML configuration with fail-fast validation
//! - **Observability**: `tracing` logging and Prometheus metrics
//! - **Startup**: pre-flight checks for the storage directory and databases
//! - **Shutdown**: graceful shutdown with SIGTERM/SIGINT handling
//!
//! # Example
//!
//! ```no_run
//! use stakeidx_operations::{
//!     config::load_config,
//!     shutdown::{ShutdownCoordinator, SignalHandler},
//!     startup::run_startup,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("stakeidx.yaml")?;
//!     let report = run_startup(&config)?;
//!     for db in &report.databases {
//!         tracing::info!(network = %db.network, state = ?db.state, "database");
//!     }
//!
//!     let signals = SignalHandler::new();
//!     let coordinator = ShutdownCoordinator::new(Duration::from_secs(
//!         config.operations.shutdown_timeout_secs,
//!     ));
//!     signals.start();
//!
//!     let reason = signals.wait().await;
//!     coordinator.shutdown(reason).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod errors;
pub mod observability;
pub mod shutdown;
pub mod startup;

pub use config::{load_config, IndexerConfig, ObservabilityConfig};
pub use errors::{ConfigError, ShutdownError, StartupError};
pub use observability::{
    init_logging, init_logging_from_config, parse_level, IndexerMetrics, LogFormat,
    LogLevelSwitch, MetricsRegistry,
};
pub use shutdown::{ShutdownAware, ShutdownCoordinator, ShutdownReason, SignalHandler, TaskGroup};
pub use startup::{run_startup, StartupReport};
