//! Configuration validation.
//!
//! Validates configuration and collects all errors before returning,
//! enabling users to fix multiple issues in a single iteration.

use crate::config::types::{
    CacheSettings, IndexerConfig, NetworkConfig, ObservabilityConfig, OperationsConfig,
    PhaseConfig, StorageConfig, SyncConfig,
};
use crate::errors::ConfigError;
use std::collections::HashSet;

/// Maximum heights per backfill batch.
const MAX_BATCH_SIZE: u64 = 10_000;

/// Minimum shutdown timeout: 1 second.
const MIN_SHUTDOWN_TIMEOUT: u64 = 1;
/// Maximum shutdown timeout: 300 seconds (5 minutes).
const MAX_SHUTDOWN_TIMEOUT: u64 = 300;

/// Validate the entire indexer configuration.
///
/// Collects all validation errors and returns them together, allowing users
/// to fix multiple issues at once.
pub fn validate_config(config: &IndexerConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_storage_config(&config.storage, &mut errors);
    validate_networks(&config.networks, &mut errors);
    validate_sync_config(&config.sync, &mut errors);
    validate_phases(&config.phases, &mut errors);
    validate_cache_config(&config.cache, &mut errors);
    validate_operations_config(&config.operations, &mut errors);
    validate_observability_config(&config.observability, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(errors))
    }
}

fn validate_storage_config(config: &StorageConfig, errors: &mut Vec<String>) {
    if config.path.is_empty() {
        errors.push("storage.path cannot be empty".to_string());
    }

    if config.read_pool_size == 0 {
        errors.push("storage.read_pool_size must be at least 1".to_string());
    }
}

fn validate_networks(networks: &[NetworkConfig], errors: &mut Vec<String>) {
    if networks.is_empty() {
        errors.push("networks must contain at least one network".to_string());
        return;
    }

    let mut seen = HashSet::new();
    for (i, network) in networks.iter().enumerate() {
        if network.name.is_empty() {
            errors.push(format!("networks[{i}].name cannot be empty"));
        } else if !network
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            // The name becomes a file name.
            errors.push(format!(
                "networks[{i}].name '{}' contains invalid characters. Only alphanumeric, hyphen, and underscore are allowed.",
                network.name
            ));
        }

        if !network.name.is_empty() && !seen.insert(network.name.as_str()) {
            errors.push(format!("networks[{i}].name '{}' is duplicated", network.name));
        }

        if !network.rpc_url.starts_with("http://") && !network.rpc_url.starts_with("https://") {
            errors.push(format!(
                "networks[{i}].rpc_url '{}' must be an http(s) URL",
                network.rpc_url
            ));
        }

        if network.request_timeout_secs == 0 {
            errors.push(format!(
                "networks[{i}].request_timeout_secs must be greater than 0"
            ));
        }

        if network.poll_interval_ms == 0 {
            errors.push(format!("networks[{i}].poll_interval_ms must be greater than 0"));
        }
    }

    if !networks.iter().any(|n| n.enabled) {
        errors.push("networks must contain at least one enabled network".to_string());
    }
}

fn validate_sync_config(config: &SyncConfig, errors: &mut Vec<String>) {
    if config.batch_size == 0 || config.batch_size > MAX_BATCH_SIZE {
        errors.push(format!(
            "sync.batch_size must be between 1 and {MAX_BATCH_SIZE}"
        ));
    }

    if config.max_batch_retries == 0 {
        errors.push("sync.max_batch_retries must be at least 1".to_string());
    }

    if config.initial_backoff_ms > config.max_backoff_ms {
        errors.push(format!(
            "sync.initial_backoff_ms ({}) cannot exceed sync.max_backoff_ms ({})",
            config.initial_backoff_ms, config.max_backoff_ms
        ));
    }

    if config.phase_check_interval_secs == 0 {
        errors.push("sync.phase_check_interval_secs must be greater than 0".to_string());
    }
}

fn validate_phases(phases: &[PhaseConfig], errors: &mut Vec<String>) {
    let capped = phases.iter().filter(|p| p.cap.is_some()).count();
    if capped > 1 {
        errors.push(format!(
            "phases: at most one phase may set a cap, found {capped}"
        ));
    }

    let mut numbers = HashSet::new();
    for (i, phase) in phases.iter().enumerate() {
        if !numbers.insert(phase.phase) {
            errors.push(format!("phases[{i}].phase {} is duplicated", phase.phase));
        }

        if phase.phase == 0 && phase.start_height != 0 {
            errors.push(format!("phases[{i}].phase 0 must start at height 0"));
        }

        if let Some(end) = phase.end_height {
            if end < phase.start_height {
                errors.push(format!(
                    "phases[{i}].end_height {end} is below start_height {}",
                    phase.start_height
                ));
            }
        }

        if phase.cap == Some(0) {
            errors.push(format!("phases[{i}].cap must be greater than 0"));
        }

        if let Some(prev) = i.checked_sub(1).and_then(|p| phases.get(p)) {
            if phase.start_height <= prev.start_height {
                errors.push(format!(
                    "phases[{i}].start_height {} must be greater than phases[{}].start_height {}",
                    phase.start_height,
                    i - 1,
                    prev.start_height
                ));
            }
        }
    }
}

fn validate_cache_config(config: &CacheSettings, errors: &mut Vec<String>) {
    if config.default_ttl_secs == 0 {
        errors.push("cache.default_ttl_secs must be greater than 0".to_string());
    }

    if config.capacity == 0 {
        errors.push("cache.capacity must be greater than 0".to_string());
    }

    if !(config.refresh_ahead_ratio > 0.0 && config.refresh_ahead_ratio <= 1.0) {
        errors.push(format!(
            "cache.refresh_ahead_ratio {} must be in (0, 1]",
            config.refresh_ahead_ratio
        ));
    }

    if config.sweep_interval_secs == 0 {
        errors.push("cache.sweep_interval_secs must be greater than 0".to_string());
    }
}

fn validate_operations_config(config: &OperationsConfig, errors: &mut Vec<String>) {
    if config.shutdown_timeout_secs < MIN_SHUTDOWN_TIMEOUT {
        errors.push(format!(
            "operations.shutdown_timeout_secs must be at least {} second(s)",
            MIN_SHUTDOWN_TIMEOUT
        ));
    }

    if config.shutdown_timeout_secs > MAX_SHUTDOWN_TIMEOUT {
        errors.push(format!(
            "operations.shutdown_timeout_secs must be at most {} seconds",
            MAX_SHUTDOWN_TIMEOUT
        ));
    }
}

fn validate_observability_config(config: &ObservabilityConfig, errors: &mut Vec<String>) {
    let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
    if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_level '{}' is invalid. Valid levels: trace, debug, info, warn, error",
            config.log_level
        ));
    }

    let valid_formats = ["json", "pretty", "text", "human"];
    if !valid_formats.contains(&config.log_format.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_format '{}' is invalid. Valid formats: json, pretty",
            config.log_format
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DecoderConfig;

    fn network(name: &str) -> NetworkConfig {
        NetworkConfig {
            name: name.to_string(),
            rpc_url: "http://127.0.0.1:26657".to_string(),
            enabled: true,
            request_timeout_secs: 10,
            poll_interval_ms: 2_000,
        }
    }

    fn phase(number: u32, start_height: u64, cap: Option<u64>) -> PhaseConfig {
        PhaseConfig {
            phase: number,
            start_height,
            end_height: None,
            protocol_version: number,
            cap,
            target_stake: None,
            timeout_secs: None,
            inactivity_secs: None,
        }
    }

    fn valid_config() -> IndexerConfig {
        IndexerConfig {
            storage: StorageConfig {
                path: "./data".to_string(),
                read_pool_size: 4,
            },
            networks: vec![network("mainnet")],
            sync: SyncConfig::default(),
            phases: vec![phase(1, 100, Some(1_000)), phase(2, 500, None)],
            decoder: DecoderConfig::default(),
            cache: CacheSettings::default(),
            operations: OperationsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    fn errors_of(config: &IndexerConfig) -> Vec<String> {
        match validate_config(config) {
            Err(ConfigError::ValidationFailed(errors)) => errors,
            other => panic!("Expected ValidationFailed error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_storage_path_fails() {
        let mut config = valid_config();
        config.storage.path = String::new();

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("storage.path")));
    }

    #[test]
    fn test_no_networks_fails() {
        let mut config = valid_config();
        config.networks.clear();

        let errors = errors_of(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("at least one network"));
    }

    #[test]
    fn test_duplicate_network_names_fail() {
        let mut config = valid_config();
        config.networks.push(network("mainnet"));

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("duplicated")));
    }

    #[test]
    fn test_network_name_must_be_file_safe() {
        let mut config = valid_config();
        config.networks[0].name = "../main".to_string();

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("invalid characters")));
    }

    #[test]
    fn test_all_networks_disabled_fails() {
        let mut config = valid_config();
        config.networks[0].enabled = false;

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("enabled network")));
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = valid_config();

        config.sync.batch_size = 0;
        assert!(errors_of(&config).iter().any(|e| e.contains("batch_size")));

        config.sync.batch_size = MAX_BATCH_SIZE + 1;
        assert!(errors_of(&config).iter().any(|e| e.contains("batch_size")));

        config.sync.batch_size = MAX_BATCH_SIZE;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_second_capped_phase_fails() {
        let mut config = valid_config();
        config.phases[1].cap = Some(5);

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("at most one phase")));
    }

    #[test]
    fn test_phases_must_increase() {
        let mut config = valid_config();
        config.phases[1].start_height = 100;

        let errors = errors_of(&config);
        assert!(errors.iter().any(|e| e.contains("must be greater than")));
    }

    #[test]
    fn test_refresh_ahead_ratio_range() {
        let mut config = valid_config();
        config.cache.refresh_ahead_ratio = 0.0;
        assert!(errors_of(&config)
            .iter()
            .any(|e| e.contains("refresh_ahead_ratio")));

        config.cache.refresh_ahead_ratio = 1.0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = valid_config();
        config.storage.path = String::new();
        config.sync.batch_size = 0;
        config.operations.shutdown_timeout_secs = 0;
        config.observability.log_level = "loud".to_string();

        let errors = errors_of(&config);
        assert!(
            errors.len() >= 4,
            "Expected at least 4 errors, got {}",
            errors.len()
        );
    }
}
