//! Configuration file loading.

use crate::config::types::IndexerConfig;
use crate::config::validation::validate_config;
use crate::errors::ConfigError;
use std::path::Path;

/// Load and validate configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or any
/// configuration value fails validation.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IndexerConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a YAML file without validating it, for callers that layer
/// overrides on top and validate the result themselves.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<IndexerConfig, ConfigError> {
    let path = path.as_ref();
    let path_str = path.display().to_string();

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path_str.clone(),
        source: e,
    })?;
    parse(&content, &path_str)
}

/// Load and validate configuration from a YAML string.
pub fn load_config_from_str(
    content: &str,
    source_name: &str,
) -> Result<IndexerConfig, ConfigError> {
    let config = parse(content, source_name)?;
    validate_config(&config)?;
    Ok(config)
}

fn parse(content: &str, source_name: &str) -> Result<IndexerConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
        path: source_name.to_string(),
        source: e,
    })
}
