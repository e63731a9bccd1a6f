//! Startup sequence over the storage directory and every enabled network.

use std::path::{Path, PathBuf};

use crate::config::IndexerConfig;
use crate::errors::StartupError;
use crate::startup::checks::{
    disk_space_note, ensure_storage_dir, inspect_network_database, DatabaseState,
};

/// A network database found (or to be created) during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDatabase {
    pub network: String,
    pub path: PathBuf,
    pub state: DatabaseState,
}

#[derive(Debug, Default)]
pub struct StartupReport {
    /// One entry per enabled network, in config order. Empty when the checks
    /// are disabled.
    pub databases: Vec<NetworkDatabase>,
    /// Non-fatal findings to log.
    pub warnings: Vec<String>,
}

/// Prepare the storage directory and inspect each enabled network's
/// database.
///
/// The directory is always created if missing. With `startup_checks` off
/// nothing else is verified; the per-network probe runs later in any case,
/// once the stores are open.
pub fn run_startup(config: &IndexerConfig) -> Result<StartupReport, StartupError> {
    if config.enabled_networks().next().is_none() {
        return Err(StartupError::NoEnabledNetworks);
    }

    let storage = Path::new(&config.storage.path);
    if !config.operations.startup_checks {
        std::fs::create_dir_all(storage)
            .map_err(|e| StartupError::storage(storage, format!("cannot be created: {e}")))?;
        tracing::info!("Startup checks disabled");
        return Ok(StartupReport::default());
    }

    ensure_storage_dir(storage, true)?;

    let mut report = StartupReport::default();
    for network in config.enabled_networks() {
        let path = config.storage.database_path(&network.name);
        let state = inspect_network_database(&network.name, &path)?;
        match state {
            DatabaseState::New => {
                tracing::info!(network = %network.name, path = %path.display(), "Database will be created")
            }
            DatabaseState::Existing { bytes } => {
                tracing::info!(network = %network.name, path = %path.display(), bytes, "Found database")
            }
        }
        report.databases.push(NetworkDatabase {
            network: network.name.clone(),
            path,
            state,
        });
    }

    let used: u64 = report
        .databases
        .iter()
        .map(|db| match db.state {
            DatabaseState::Existing { bytes } => bytes,
            DatabaseState::New => 0,
        })
        .sum();
    if let Some(note) = disk_space_note(storage, config.operations.min_disk_space_mb, used) {
        report.warnings.push(note);
    }

    tracing::info!(
        networks = report.databases.len(),
        warnings = report.warnings.len(),
        "Startup checks complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use tempfile::TempDir;

    fn config_at(path: &Path) -> IndexerConfig {
        let yaml = format!(
            r#"
storage:
  path: "{}"
networks:
  - name: mainnet
    rpc_url: "http://127.0.0.1:26657"
  - name: devnet
    rpc_url: "http://127.0.0.1:46657"
    enabled: false
"#,
            path.display()
        );
        load_config_from_str(&yaml, "test.yaml").unwrap()
    }

    #[test]
    fn test_creates_directory_and_lists_enabled_networks() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("data");
        let config = config_at(&dir);

        let report = run_startup(&config).unwrap();
        assert!(dir.is_dir());
        assert_eq!(
            report.databases,
            vec![NetworkDatabase {
                network: "mainnet".to_string(),
                path: config.storage.database_path("mainnet"),
                state: DatabaseState::New,
            }]
        );
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_existing_database_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = config_at(temp.path());
        std::fs::write(config.storage.database_path("mainnet"), vec![0u8; 512]).unwrap();

        let report = run_startup(&config).unwrap();
        assert_eq!(report.databases[0].state, DatabaseState::Existing { bytes: 512 });
    }

    #[test]
    fn test_database_path_taken_by_directory() {
        let temp = TempDir::new().unwrap();
        let config = config_at(temp.path());
        std::fs::create_dir(config.storage.database_path("mainnet")).unwrap();

        assert!(matches!(
            run_startup(&config),
            Err(StartupError::Database { .. })
        ));
    }

    #[test]
    fn test_disabled_checks_only_create_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("data");
        let mut config = config_at(&dir);
        config.operations.startup_checks = false;

        let report = run_startup(&config).unwrap();
        assert!(dir.is_dir());
        assert!(report.databases.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_no_enabled_networks() {
        let temp = TempDir::new().unwrap();
        let mut config = config_at(temp.path());
        for network in &mut config.networks {
            network.enabled = false;
        }
        assert!(matches!(
            run_startup(&config),
            Err(StartupError::NoEnabledNetworks)
        ));
    }
}
