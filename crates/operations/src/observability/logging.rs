//! Structured logging with runtime-adjustable log levels.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` behind a
//! reload layer, so the level can be changed while the process runs.
//! `RUST_LOG`, when set, takes precedence over the configured level at startup.

use crate::errors::StartupError;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle for runtime log level adjustment.
pub struct LogLevelSwitch {
    handle: reload::Handle<EnvFilter, Registry>,
    level: AtomicU8,
}

impl LogLevelSwitch {
    /// Set the minimum log level at runtime.
    pub fn set_level(&self, level: Level) -> Result<(), StartupError> {
        self.handle
            .reload(filter_for(level))
            .map_err(|e| StartupError::Logging(e.to_string()))?;
        self.level.store(level_to_u8(level), Ordering::SeqCst);
        Ok(())
    }

    /// Get the current log level.
    pub fn level(&self) -> Level {
        u8_to_level(self.level.load(Ordering::SeqCst))
    }
}

/// Log format for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for machine parsing (production).
    #[default]
    Json,
    /// Human-readable format (development).
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Parse from string, case-insensitive. Defaults to Json for unknown values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" | "text" | "human" => Self::Pretty,
            _ => Self::Json,
        })
    }
}

/// Parse log level from string. Unknown values map to `INFO`.
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn level_to_u8(level: Level) -> u8 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

fn u8_to_level(val: u8) -> Level {
    match val {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

/// Initialize logging from configuration strings.
///
/// # Example
///
/// ```no_run
/// use stakeidx_operations::observability::logging::init_logging_from_config;
///
/// let level_switch = init_logging_from_config("info", "json").unwrap();
/// tracing::info!(version = "0.1.0", "indexer started");
/// ```
pub fn init_logging_from_config(level: &str, format: &str) -> Result<LogLevelSwitch, StartupError> {
    let level = parse_level(level);
    let format: LogFormat = format.parse().unwrap_or_default();
    init_logging(level, format)
}

/// Install the global subscriber.
///
/// Returns a handle to adjust the level at runtime. Fails if a global
/// subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat) -> Result<LogLevelSwitch, StartupError> {
    let initial = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    let (filter, handle) = reload::Layer::new(initial);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    installed.map_err(|e| StartupError::Logging(e.to_string()))?;

    Ok(LogLevelSwitch {
        handle,
        level: AtomicU8::new(level_to_u8(level)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("Info"), Level::INFO);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("unknown".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            Level::ERROR,
            Level::WARN,
            Level::INFO,
            Level::DEBUG,
            Level::TRACE,
        ] {
            assert_eq!(u8_to_level(level_to_u8(level)), level);
        }
    }

    #[test]
    fn test_init_and_adjust_level() {
        let switch = init_logging(Level::INFO, LogFormat::Pretty).unwrap();
        assert_eq!(switch.level(), Level::INFO);

        switch.set_level(Level::DEBUG).unwrap();
        assert_eq!(switch.level(), Level::DEBUG);

        // A second global subscriber is refused.
        assert!(matches!(
            init_logging(Level::INFO, LogFormat::Json),
            Err(StartupError::Logging(_))
        ));
    }
}
