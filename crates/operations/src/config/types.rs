//! Configuration types for the indexer.

use serde::Deserialize;
use stakeidx_chain_index::{CacheConfig, PhaseDefinition};

/// Root configuration for an indexer process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexerConfig {
    /// Storage configuration.
    pub storage: StorageConfig,

    /// Networks to index. One SQLite database per network.
    pub networks: Vec<NetworkConfig>,

    /// Backfill and live sync tuning.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Phase boundary table shared by every network.
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,

    /// Event names the default decoder recognizes.
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Read-side cache configuration.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Operations configuration.
    #[serde(default)]
    pub operations: OperationsConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl IndexerConfig {
    /// Phase definitions in configuration order.
    pub fn phase_definitions(&self) -> Vec<PhaseDefinition> {
        self.phases.iter().map(PhaseConfig::to_definition).collect()
    }

    /// Enabled networks only.
    pub fn enabled_networks(&self) -> impl Iterator<Item = &NetworkConfig> {
        self.networks.iter().filter(|n| n.enabled)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding one `<network>.sqlite` file per network.
    pub path: String,

    /// Read connections per database. Default: 4.
    #[serde(default = "StorageConfig::default_read_pool_size")]
    pub read_pool_size: u32,
}

impl StorageConfig {
    const fn default_read_pool_size() -> u32 {
        4
    }

    /// Database file for a network.
    pub fn database_path(&self, network: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.path).join(format!("{network}.sqlite"))
    }
}

/// A chain to index.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Unique network name, also the database file stem.
    pub name: String,

    /// CometBFT JSON-RPC endpoint.
    pub rpc_url: String,

    #[serde(default = "NetworkConfig::default_enabled")]
    pub enabled: bool,

    /// Per-request timeout. Default: 10.
    #[serde(default = "NetworkConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Head polling interval for the live feed. Default: 2000.
    #[serde(default = "NetworkConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl NetworkConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_request_timeout_secs() -> u64 {
        10
    }

    const fn default_poll_interval_ms() -> u64 {
        2_000
    }
}

/// Backfill and live sync configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Heights per backfill batch. Default: 100.
    #[serde(default = "SyncConfig::default_batch_size")]
    pub batch_size: u64,

    /// Heights below the head to start from on an empty database. Default: 1000.
    #[serde(default = "SyncConfig::default_bootstrap_window")]
    pub bootstrap_window: u64,

    /// Attempts per batch before it is recorded as skipped. Default: 5.
    #[serde(default = "SyncConfig::default_max_batch_retries")]
    pub max_batch_retries: u32,

    #[serde(default = "SyncConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "SyncConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Whether to run the live subscription after startup. Default: true.
    #[serde(default = "SyncConfig::default_live_enabled")]
    pub live_enabled: bool,

    #[serde(default = "SyncConfig::default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,

    /// How often phase completion conditions are evaluated. Default: 30.
    #[serde(default = "SyncConfig::default_phase_check_interval_secs")]
    pub phase_check_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            bootstrap_window: Self::default_bootstrap_window(),
            max_batch_retries: Self::default_max_batch_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            live_enabled: Self::default_live_enabled(),
            resubscribe_delay_ms: Self::default_resubscribe_delay_ms(),
            phase_check_interval_secs: Self::default_phase_check_interval_secs(),
        }
    }
}

impl SyncConfig {
    const fn default_batch_size() -> u64 {
        100
    }

    const fn default_bootstrap_window() -> u64 {
        1_000
    }

    const fn default_max_batch_retries() -> u32 {
        5
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        30_000
    }

    const fn default_live_enabled() -> bool {
        true
    }

    const fn default_resubscribe_delay_ms() -> u64 {
        1_000
    }

    const fn default_phase_check_interval_secs() -> u64 {
        30
    }
}

/// One row of the phase boundary table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    pub phase: u32,
    pub start_height: u64,
    #[serde(default)]
    pub end_height: Option<u64>,
    pub protocol_version: u32,
    /// Global active-stake cap. At most one phase may set it.
    #[serde(default)]
    pub cap: Option<u64>,
    #[serde(default)]
    pub target_stake: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub inactivity_secs: Option<u64>,
}

impl PhaseConfig {
    pub fn to_definition(&self) -> PhaseDefinition {
        PhaseDefinition {
            phase: self.phase,
            start_height: self.start_height,
            end_height: self.end_height,
            protocol_version: self.protocol_version,
            cap: self.cap,
            target_stake: self.target_stake,
            timeout_secs: self.timeout_secs,
            inactivity_secs: self.inactivity_secs,
        }
    }
}

/// Event types the default decoder maps to message kinds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default = "DecoderConfig::default_stake_events")]
    pub stake_events: Vec<String>,

    #[serde(default = "DecoderConfig::default_unstake_events")]
    pub unstake_events: Vec<String>,

    #[serde(default = "DecoderConfig::default_transfer_events")]
    pub transfer_events: Vec<String>,

    #[serde(default = "DecoderConfig::default_reward_events")]
    pub reward_events: Vec<String>,

    /// Only stakes in this denomination are accepted when set.
    #[serde(default)]
    pub stake_denom: Option<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            stake_events: Self::default_stake_events(),
            unstake_events: Self::default_unstake_events(),
            transfer_events: Self::default_transfer_events(),
            reward_events: Self::default_reward_events(),
            stake_denom: None,
        }
    }
}

impl DecoderConfig {
    fn default_stake_events() -> Vec<String> {
        vec!["stake".to_string(), "create_delegation".to_string()]
    }

    fn default_unstake_events() -> Vec<String> {
        vec!["unstake".to_string(), "unbond".to_string()]
    }

    fn default_transfer_events() -> Vec<String> {
        vec!["transfer".to_string()]
    }

    fn default_reward_events() -> Vec<String> {
        vec!["withdraw_rewards".to_string()]
    }
}

/// Read-side cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "CacheSettings::default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Maximum entries per cache before LRU eviction. Default: 10000.
    #[serde(default = "CacheSettings::default_capacity")]
    pub capacity: usize,

    /// Fraction of the ttl after which a fresh hit triggers a background refresh.
    #[serde(default = "CacheSettings::default_refresh_ahead_ratio")]
    pub refresh_ahead_ratio: f64,

    #[serde(default = "CacheSettings::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: Self::default_ttl_secs(),
            capacity: Self::default_capacity(),
            refresh_ahead_ratio: Self::default_refresh_ahead_ratio(),
            sweep_interval_secs: Self::default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    const fn default_ttl_secs() -> u64 {
        30
    }

    const fn default_capacity() -> usize {
        10_000
    }

    const fn default_refresh_ahead_ratio() -> f64 {
        0.8
    }

    const fn default_sweep_interval_secs() -> u64 {
        60
    }

    /// Convert to the chain index cache config.
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl_secs: self.default_ttl_secs,
            capacity: self.capacity,
            refresh_ahead_ratio: self.refresh_ahead_ratio,
        }
    }
}

/// Operations configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationsConfig {
    /// Shutdown timeout in seconds. Default: 30.
    #[serde(default = "OperationsConfig::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Whether to run startup checks. Default: true.
    #[serde(default = "OperationsConfig::default_startup_checks")]
    pub startup_checks: bool,

    /// Minimum required disk space in MB. Default: 1024 (1GB).
    #[serde(default = "OperationsConfig::default_min_disk_space_mb")]
    pub min_disk_space_mb: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
            startup_checks: Self::default_startup_checks(),
            min_disk_space_mb: Self::default_min_disk_space_mb(),
        }
    }
}

impl OperationsConfig {
    const fn default_shutdown_timeout_secs() -> u64 {
        30
    }

    const fn default_startup_checks() -> bool {
        true
    }

    const fn default_min_disk_space_mb() -> u64 {
        1024
    }
}

/// Observability configuration for logging and metrics.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level: trace, debug, info, warn, error. Default: info.
    #[serde(default = "ObservabilityConfig::default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty. Default: json.
    #[serde(default = "ObservabilityConfig::default_log_format")]
    pub log_format: String,

    /// Whether Prometheus metrics are collected. Default: true.
    #[serde(default = "ObservabilityConfig::default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: Self::default_log_format(),
            metrics_enabled: Self::default_metrics_enabled(),
        }
    }
}

impl ObservabilityConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_log_format() -> String {
        "json".to_string()
    }

    const fn default_metrics_enabled() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sync_config() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.bootstrap_window, 1_000);
        assert_eq!(config.max_batch_retries, 5);
        assert!(config.live_enabled);
        assert_eq!(config.phase_check_interval_secs, 30);
    }

    #[test]
    fn test_default_cache_settings_convert() {
        let cache = CacheSettings::default().to_cache_config();
        assert_eq!(cache.default_ttl_secs, 30);
        assert_eq!(cache.capacity, 10_000);
        assert!((cache.refresh_ahead_ratio - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_operations_config() {
        let config = OperationsConfig::default();
        assert_eq!(config.shutdown_timeout_secs, 30);
        assert!(config.startup_checks);
        assert_eq!(config.min_disk_space_mb, 1024);
    }

    #[test]
    fn test_phase_config_to_definition() {
        let phase = PhaseConfig {
            phase: 1,
            start_height: 200,
            end_height: Some(900),
            protocol_version: 2,
            cap: Some(1_000),
            target_stake: None,
            timeout_secs: Some(3_600),
            inactivity_secs: None,
        };
        let def = phase.to_definition();
        assert_eq!(def.phase, 1);
        assert_eq!(def.cap, Some(1_000));
        assert_eq!(def.end_height, Some(900));
        assert!(def.is_capped());
    }

    #[test]
    fn test_database_path_per_network() {
        let storage = StorageConfig {
            path: "/var/lib/stakeidx".to_string(),
            read_pool_size: 4,
        };
        assert_eq!(
            storage.database_path("mainnet"),
            std::path::PathBuf::from("/var/lib/stakeidx/mainnet.sqlite")
        );
    }
}
