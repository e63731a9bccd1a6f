//! Individual pre-flight checks.

use std::path::Path;

use crate::errors::StartupError;

const WRITE_PROBE: &str = ".stakeidx_probe";

/// What was found at a network's database path before opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    /// No file yet; the store creates it with a fresh schema.
    New,
    Existing { bytes: u64 },
}

/// Make sure the storage directory exists (creating it when `create` is set)
/// and that files can be written into it.
pub fn ensure_storage_dir(path: &Path, create: bool) -> Result<(), StartupError> {
    if !path.exists() {
        if !create {
            return Err(StartupError::storage(path, "does not exist"));
        }
        std::fs::create_dir_all(path)
            .map_err(|e| StartupError::storage(path, format!("cannot be created: {e}")))?;
        tracing::info!(path = %path.display(), "Created storage directory");
    }

    if !path.is_dir() {
        return Err(StartupError::storage(path, "is not a directory"));
    }

    let probe = path.join(WRITE_PROBE);
    std::fs::write(&probe, b"probe")
        .map_err(|e| StartupError::storage(path, format!("is not writable: {e}")))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Look at a network's database file without opening it.
pub fn inspect_network_database(network: &str, path: &Path) -> Result<DatabaseState, StartupError> {
    let fail = |reason: String| StartupError::Database {
        network: network.to_string(),
        path: path.to_path_buf(),
        reason,
    };

    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DatabaseState::New),
        Err(e) => return Err(fail(format!("cannot be inspected: {e}"))),
    };
    if !meta.is_file() {
        return Err(fail("is not a regular file".to_string()));
    }
    if meta.permissions().readonly() {
        return Err(fail("is read-only".to_string()));
    }
    Ok(DatabaseState::Existing { bytes: meta.len() })
}

/// Run a probe against an opened network store. The probe's error becomes
/// `StartupError::Database` for that network.
pub fn check_network_database<F, E>(network: &str, path: &Path, probe: F) -> Result<(), StartupError>
where
    F: FnOnce() -> Result<(), E>,
    E: std::fmt::Display,
{
    probe().map_err(|e| StartupError::Database {
        network: network.to_string(),
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Free space is not queried (no portable API without platform bindings);
/// the note states the requirement next to what the databases already use.
pub fn disk_space_note(path: &Path, required_mb: u64, used_bytes: u64) -> Option<String> {
    if required_mb == 0 {
        return None;
    }
    Some(format!(
        "free disk space at {} not verified: {required_mb}MB required, databases use {}MB",
        path.display(),
        used_bytes / (1024 * 1024)
    ))
}
