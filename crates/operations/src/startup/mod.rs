//! Pre-flight checks run before any network store is opened.

pub mod checks;
mod sequence;

pub use checks::{
    check_network_database, disk_space_note, ensure_storage_dir, inspect_network_database,
    DatabaseState,
};
pub use sequence::{run_startup, NetworkDatabase, StartupReport};
