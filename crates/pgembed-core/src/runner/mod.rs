//! Instance runners.
//!
//! A runner owns the actual start/stop operations against the database
//! engine. The supervisor only ever sees the two methods of
//! [`InstanceRunner`]; how the server is provisioned and spawned stays
//! behind them.
//!
//! # Runners
//!
//! - **`PostgresRunner`** - drives locally installed PostgreSQL binaries
//!   (`initdb`, `pg_ctl`, `createdb`).
//! - Library runners - any runner exported from a dynamic library with
//!   `export_instance_runner!` and loaded through a `CodeScope`.

mod postgres;

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InstanceConfig;

pub use postgres::{BIN_DIR_ENV, PgBinaries, PostgresRunner};

/// Observable part of a running instance.
///
/// The live handle (process, pid file, hook registration) stays inside the
/// runner; this is what it reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Port the server accepts connections on.
    pub port: u16,
    /// Postmaster pid, when the runner can tell.
    pub pid: Option<u32>,
    /// Data directory backing the instance.
    pub data_dir: PathBuf,
}

/// Contract between the supervisor and the engine.
///
/// `stop` must be callable after `start` returns even when nothing from the
/// starting call site is still around, and must return `Ok(())` when no
/// instance is running.
pub trait InstanceRunner: Send + Sync {
    /// Bring the instance described by `config` up.
    fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError>;

    /// Bring the running instance down. A no-op when nothing is running.
    fn stop(&self) -> Result<(), RunnerError>;
}

impl<T: InstanceRunner + ?Sized> InstanceRunner for std::sync::Arc<T> {
    fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
        (**self).start(config)
    }

    fn stop(&self) -> Result<(), RunnerError> {
        (**self).stop()
    }
}

/// Failures reported by a runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The configured port is already bound by another process.
    #[error("port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A required engine binary could not be located.
    #[error("binary `{0}` not found")]
    BinaryNotFound(String),

    /// An engine command exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    /// `start` called while an instance is already up.
    #[error("an instance is already running on port {0}")]
    AlreadyRunning(u16),

    /// The server did not accept connections in time.
    #[error("server on port {port} not accepting connections after {seconds}s")]
    Timeout { port: u16, seconds: u64 },

    /// The runner rejected the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The runner panicked while handling the request.
    #[error("runner panicked: {0}")]
    Panicked(String),

    /// Error reported across the boundary of a loaded runner library.
    #[error("{message} (status {status})")]
    Library { status: i32, message: String },

    /// JSON encoding of data exchanged with a runner library.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
