//! Filesystem locations used by supervised instances.

use std::path::{Path, PathBuf};

/// Default data directory for an instance listening on `port`.
///
/// ```text
/// <local data dir>/pgembed/
/// └── 5432/
///     ├── data/          # PostgreSQL cluster
///     └── data.log       # server log (pg_ctl -l)
/// ```
///
/// Falls back to the system temp directory when the platform has no local
/// data directory.
pub fn default_data_dir(port: u16) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pgembed")
        .join(port.to_string())
        .join("data")
}

/// Server log file for a data directory.
///
/// Kept beside the data directory, since `initdb` requires the data
/// directory itself to be empty.
pub fn log_file(data_dir: &Path) -> PathBuf {
    let name = data_dir
        .file_name()
        .map(|n| format!("{}.log", n.to_string_lossy()))
        .unwrap_or_else(|| "postgres.log".to_string());
    match data_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

/// Marker file `initdb` leaves in an initialized cluster.
pub fn version_marker(data_dir: &Path) -> PathBuf {
    data_dir.join("PG_VERSION")
}

/// Pid file the postmaster writes while running.
pub fn postmaster_pid(data_dir: &Path) -> PathBuf {
    data_dir.join("postmaster.pid")
}
