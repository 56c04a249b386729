//! Instance configuration record.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths;

/// Host the supervised server listens on.
pub const LISTEN_HOST: &str = "127.0.0.1";

/// Immutable description of one server instance.
///
/// Built once by the caller and passed by value into the supervisor. The
/// same record crosses the FFI boundary as JSON when the runner lives in a
/// dynamically loaded scope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Engine version, e.g. `15.4`.
    pub version: String,
    /// TCP port, assigned by the caller; must be free.
    pub port: u16,
    /// Database created on first start.
    pub database: String,
    pub username: String,
    pub password: String,
    /// Data directory; must be writable.
    pub data_dir: PathBuf,
    pub locale: String,
    pub charset: String,
}

impl InstanceConfig {
    /// Identity used in logs and errors: `<database>@127.0.0.1:<port>`.
    pub fn instance_id(&self) -> String {
        format!("{}@{}:{}", self.database, LISTEN_HOST, self.port)
    }

    /// Check the record before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(Error::Config("engine version must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Config("database name must not be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config("username must not be empty".to_string()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data directory must not be empty".to_string()));
        }
        if self.locale.trim().is_empty() || self.charset.trim().is_empty() {
            return Err(Error::Config(
                "locale and charset must both be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Major component of the configured engine version (`15.4` -> `15`).
    pub fn major_version(&self) -> &str {
        self.version.split('.').next().unwrap_or(&self.version)
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        let port = 5432;
        Self {
            version: "15".to_string(),
            port,
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            data_dir: paths::default_data_dir(port),
            locale: "C".to_string(),
            charset: "UTF8".to_string(),
        }
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("version", &self.version)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("locale", &self.locale)
            .field("charset", &self.charset)
            .finish()
    }
}
