//! Observability infrastructure for the indexer.
//!
//! - **Logging**: structured `tracing` output with runtime-adjustable levels
//! - **Metrics**: Prometheus-compatible ingestion and cache metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_from_config, parse_level, LogFormat, LogLevelSwitch};
pub use metrics::{IndexerMetrics, MetricsRegistry};
