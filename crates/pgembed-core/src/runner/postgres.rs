//! PostgreSQL runner backed by locally installed binaries.
//!
//! Binaries are located, never downloaded. A fresh data directory is
//! initialized with `initdb`, the server is started with `pg_ctl start -w`
//! and the configured database is created with `createdb`.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{InstanceConfig, LISTEN_HOST};
use crate::paths;

use super::{InstanceInfo, InstanceRunner, RunnerError};

/// Environment variable naming the directory holding the PostgreSQL binaries.
pub const BIN_DIR_ENV: &str = "PGEMBED_BIN_DIR";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Paths to the PostgreSQL binaries the runner drives.
#[derive(Debug, Clone)]
pub struct PgBinaries {
    pub initdb: PathBuf,
    pub pg_ctl: PathBuf,
    pub postgres: PathBuf,
    pub createdb: PathBuf,
}

impl PgBinaries {
    /// Locate all binaries.
    ///
    /// Looks in the following order, and only in the first that applies:
    /// 1. `bin_dir`, when given
    /// 2. `PGEMBED_BIN_DIR` environment variable
    /// 3. System PATH
    pub fn locate(bin_dir: Option<&Path>) -> Result<Self, RunnerError> {
        let env_dir = std::env::var_os(BIN_DIR_ENV).map(PathBuf::from);
        let dir = bin_dir.map(Path::to_path_buf).or(env_dir);

        Ok(Self {
            initdb: Self::find("initdb", dir.as_deref())?,
            pg_ctl: Self::find("pg_ctl", dir.as_deref())?,
            postgres: Self::find("postgres", dir.as_deref())?,
            createdb: Self::find("createdb", dir.as_deref())?,
        })
    }

    fn find(name: &str, dir: Option<&Path>) -> Result<PathBuf, RunnerError> {
        let file_name = if cfg!(windows) {
            format!("{}.exe", name)
        } else {
            name.to_string()
        };

        match dir {
            Some(dir) => {
                let path = dir.join(&file_name);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(RunnerError::BinaryNotFound(path.display().to_string()))
                }
            }
            None => which::which(&file_name).map_err(|_| RunnerError::BinaryNotFound(file_name)),
        }
    }

    /// Version reported by `postgres --version`, e.g. `15.4`.
    pub fn server_version(&self) -> Result<String, RunnerError> {
        let output = run_command(Command::new(&self.postgres).arg("--version"), "postgres")?;
        Ok(parse_server_version(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Runner that supervises one PostgreSQL server through `pg_ctl`.
pub struct PostgresRunner {
    bin_dir: Option<PathBuf>,
    startup_timeout: Duration,
    running: Mutex<Option<RunningServer>>,
}

/// The live server. Only reachable through the runner that started it.
struct RunningServer {
    pg_ctl: PathBuf,
    data_dir: PathBuf,
    port: u16,
}

impl PostgresRunner {
    /// Create a runner that locates binaries via `PGEMBED_BIN_DIR` or PATH.
    pub fn new() -> Self {
        Self {
            bin_dir: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            running: Mutex::new(None),
        }
    }

    /// Use binaries from `dir` only.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    /// How long to wait for the server to accept connections.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Whether this runner currently owns a started server.
    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_version(bins: &PgBinaries, config: &InstanceConfig) {
        match bins.server_version() {
            Ok(found) => {
                let found_major = found.split('.').next().unwrap_or(&found);
                if found_major != config.major_version() {
                    tracing::warn!(
                        configured = %config.version,
                        found = %found,
                        "PostgreSQL binary version differs from configured version"
                    );
                }
            }
            Err(e) => tracing::warn!("Could not determine PostgreSQL version: {}", e),
        }
    }

    fn init_cluster(bins: &PgBinaries, config: &InstanceConfig) -> Result<(), RunnerError> {
        if paths::version_marker(&config.data_dir).exists() {
            tracing::debug!(data_dir = %config.data_dir.display(), "reusing initialized data directory");
            return Ok(());
        }

        fs::create_dir_all(&config.data_dir)?;

        // initdb reads the superuser password from a file, never argv
        let mut pwfile = tempfile::NamedTempFile::new()?;
        writeln!(pwfile, "{}", config.password)?;
        pwfile.flush()?;

        let mut pwfile_arg = OsString::from("--pwfile=");
        pwfile_arg.push(pwfile.path());

        tracing::info!(data_dir = %config.data_dir.display(), "initializing data directory");
        run_command(
            Command::new(&bins.initdb)
                .arg("-D")
                .arg(&config.data_dir)
                .arg("-U")
                .arg(&config.username)
                .arg(pwfile_arg)
                .arg("-A")
                .arg("md5")
                .arg("-E")
                .arg(&config.charset)
                .arg(format!("--locale={}", config.locale)),
            "initdb",
        )?;

        Ok(())
    }

    fn start_server(&self, bins: &PgBinaries, config: &InstanceConfig) -> Result<(), RunnerError> {
        let mut options = format!("-p {} -h {}", config.port, LISTEN_HOST);
        if cfg!(unix) {
            // TCP only; socket paths under deep temp dirs overflow sun_path
            options.push_str(" -c unix_socket_directories=''");
        }

        let log_file = paths::log_file(&config.data_dir);
        tracing::info!(port = config.port, log = %log_file.display(), "starting PostgreSQL");
        run_command(
            Command::new(&bins.pg_ctl)
                .arg("-D")
                .arg(&config.data_dir)
                .arg("-l")
                .arg(&log_file)
                .arg("-w")
                .arg("-t")
                .arg(self.startup_timeout.as_secs().max(1).to_string())
                .arg("-o")
                .arg(options)
                .arg("start"),
            "pg_ctl",
        )?;

        Ok(())
    }

    fn create_database(bins: &PgBinaries, config: &InstanceConfig) -> Result<(), RunnerError> {
        if config.database == "postgres" {
            return Ok(());
        }

        let output = Command::new(&bins.createdb)
            .arg("-h")
            .arg(LISTEN_HOST)
            .arg("-p")
            .arg(config.port.to_string())
            .arg("-U")
            .arg(&config.username)
            .arg(&config.database)
            .env("PGPASSWORD", &config.password)
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("already exists") {
            tracing::debug!(database = %config.database, "database already exists");
            return Ok(());
        }

        Err(RunnerError::Command {
            program: "createdb".to_string(),
            status: output.status.to_string(),
            stderr,
        })
    }
}

impl Default for PostgresRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRunner for PostgresRunner {
    fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
        let mut running = self.running();
        if let Some(server) = running.as_ref() {
            return Err(RunnerError::AlreadyRunning(server.port));
        }

        ensure_port_free(config.port)?;
        let bins = PgBinaries::locate(self.bin_dir.as_deref())?;
        Self::check_version(&bins, config);
        Self::init_cluster(&bins, config)?;

        let server = RunningServer {
            pg_ctl: bins.pg_ctl.clone(),
            data_dir: config.data_dir.clone(),
            port: config.port,
        };

        // pg_ctl may fail after the postmaster is already up (e.g. -t timeout),
        // so every failure from here on must take the server down
        let ready = self
            .start_server(&bins, config)
            .and_then(|()| wait_until_accepting(config.port, self.startup_timeout))
            .and_then(|()| Self::create_database(&bins, config));
        if let Err(e) = ready {
            if let Err(stop_err) = server.shutdown() {
                tracing::warn!(
                    port = config.port,
                    "Failed to stop server after start error, keeping it for a later stop: {}",
                    stop_err
                );
                *running = Some(server);
            }
            return Err(e);
        }

        let info = InstanceInfo {
            port: config.port,
            pid: read_postmaster_pid(&config.data_dir),
            data_dir: config.data_dir.clone(),
        };
        *running = Some(server);

        tracing::info!(port = info.port, pid = ?info.pid, "PostgreSQL is accepting connections");
        Ok(info)
    }

    fn stop(&self) -> Result<(), RunnerError> {
        let mut running = self.running();
        let Some(server) = running.take() else {
            tracing::debug!("no running PostgreSQL instance, nothing to stop");
            return Ok(());
        };

        if let Err(e) = server.shutdown() {
            // Keep the record so a later stop can retry
            *running = Some(server);
            return Err(e);
        }

        Ok(())
    }
}

impl RunningServer {
    fn shutdown(&self) -> Result<(), RunnerError> {
        if !paths::postmaster_pid(&self.data_dir).exists() {
            tracing::debug!(port = self.port, "postmaster.pid gone, server already stopped");
            return Ok(());
        }

        tracing::info!(port = self.port, "stopping PostgreSQL");
        run_command(
            Command::new(&self.pg_ctl)
                .arg("-D")
                .arg(&self.data_dir)
                .arg("-m")
                .arg("fast")
                .arg("-w")
                .arg("stop"),
            "pg_ctl",
        )?;
        Ok(())
    }
}

/// Fail with `PortInUse` if `port` cannot be bound on the listen host.
pub(crate) fn ensure_port_free(port: u16) -> Result<(), RunnerError> {
    match TcpListener::bind((LISTEN_HOST, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(source) if source.kind() == std::io::ErrorKind::AddrInUse => {
            Err(RunnerError::PortInUse { port, source })
        }
        Err(e) => Err(RunnerError::Io(e)),
    }
}

fn wait_until_accepting(port: u16, timeout: Duration) -> Result<(), RunnerError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let deadline = Instant::now() + timeout;

    loop {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RunnerError::Timeout {
                port,
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn read_postmaster_pid(data_dir: &Path) -> Option<u32> {
    let contents = fs::read_to_string(paths::postmaster_pid(data_dir)).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

fn parse_server_version(output: &str) -> String {
    let mut tokens = output.split_whitespace();
    let after_product = tokens
        .by_ref()
        .skip_while(|t| *t != "(PostgreSQL)")
        .nth(1);
    after_product
        .or_else(|| output.split_whitespace().last())
        .unwrap_or_default()
        .to_string()
}

fn run_command(cmd: &mut Command, program: &str) -> Result<Output, RunnerError> {
    tracing::debug!(command = ?cmd, "running");

    let output = cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RunnerError::BinaryNotFound(program.to_string())
        } else {
            RunnerError::Io(e)
        }
    })?;

    if !output.status.success() {
        return Err(RunnerError::Command {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}
