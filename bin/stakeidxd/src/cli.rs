//! Command-line arguments and config resolution.

use std::path::PathBuf;

use clap::Args;
use stakeidx_operations::config::{read_config, validate_config};
use stakeidx_operations::{ConfigError, IndexerConfig};

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', default_value = "stakeidx.yaml")]
    pub config: PathBuf,

    /// Directory for the per-network databases (overrides storage.path)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Log level (overrides observability.log_level)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Only handle these networks; may be repeated
    #[arg(long = "network")]
    pub networks: Vec<String>,
}

/// Resolve the config from: defaults < YAML < CLI flags.
pub fn resolve_config(args: &CommonArgs) -> Result<IndexerConfig, ConfigError> {
    let mut config = read_config(&args.config)?;

    if let Some(dir) = &args.data_dir {
        config.storage.path = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }
    if !args.networks.is_empty() {
        if let Some(unknown) = args
            .networks
            .iter()
            .find(|name| !config.networks.iter().any(|n| &n.name == *name))
        {
            return Err(ConfigError::UnknownNetwork(unknown.clone()));
        }
        // Naming a network selects it even if the file disables it.
        for network in &mut config.networks {
            network.enabled = args.networks.contains(&network.name);
        }
    }

    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
storage:
  path: "./data"
networks:
  - name: mainnet
    rpc_url: "http://127.0.0.1:26657"
  - name: testnet
    rpc_url: "http://127.0.0.1:36657"
    enabled: false
phases:
  - phase: 1
    start_height: 100
    protocol_version: 1
    cap: 1000
"#;

    fn args(file: &tempfile::NamedTempFile) -> CommonArgs {
        CommonArgs {
            config: file.path().to_path_buf(),
            data_dir: None,
            log_level: None,
            networks: Vec::new(),
        }
    }

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_flags_override_file() {
        let file = config_file();
        let resolved = resolve_config(&CommonArgs {
            data_dir: Some("/var/lib/stakeidx".to_string()),
            log_level: Some("debug".to_string()),
            ..args(&file)
        })
        .unwrap();

        assert_eq!(resolved.storage.path, "/var/lib/stakeidx");
        assert_eq!(resolved.observability.log_level, "debug");
        let enabled: Vec<&str> = resolved.enabled_networks().map(|n| n.name.as_str()).collect();
        assert_eq!(enabled, vec!["mainnet"]);
    }

    #[test]
    fn test_network_selection() {
        let file = config_file();
        let resolved = resolve_config(&CommonArgs {
            networks: vec!["testnet".to_string()],
            ..args(&file)
        })
        .unwrap();
        let enabled: Vec<&str> = resolved.enabled_networks().map(|n| n.name.as_str()).collect();
        assert_eq!(enabled, vec!["testnet"]);

        let both = resolve_config(&CommonArgs {
            networks: vec!["mainnet".to_string(), "testnet".to_string()],
            ..args(&file)
        })
        .unwrap();
        assert_eq!(both.enabled_networks().count(), 2);

        let err = resolve_config(&CommonArgs {
            networks: vec!["devnet".to_string()],
            ..args(&file)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNetwork(name) if name == "devnet"));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let file = config_file();
        let err = resolve_config(&CommonArgs {
            log_level: Some("loud".to_string()),
            ..args(&file)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }
}
