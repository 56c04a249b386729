//! Run command: start one instance under the process-wide supervisor.
//!
//! The instance stays up until Ctrl+C (or SIGTERM/SIGHUP on unix), then is
//! stopped through the same supervisor that started it. If the process
//! exits any other way, the exit hook registered at start takes care of the
//! stop.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use pgembed_core::config::LISTEN_HOST;
use pgembed_core::{CodeScope, InstanceConfig, InterruptHandle, PostgresRunner, global};
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::colors;

#[derive(Args)]
pub struct RunArgs {
    /// JSON file with the instance configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// PostgreSQL version, e.g. 15 or 15.4
    #[arg(long = "pg-version")]
    pg_version: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Database created on first start
    #[arg(long)]
    database: Option<String>,

    /// Superuser name
    #[arg(long)]
    username: Option<String>,

    /// Superuser password
    #[arg(long)]
    password: Option<String>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    locale: Option<String>,

    #[arg(long)]
    charset: Option<String>,

    /// Directory containing initdb, pg_ctl, postgres and createdb
    #[arg(long)]
    bin_dir: Option<PathBuf>,

    /// Runner library to load instead of the built-in PostgreSQL runner
    #[arg(long)]
    library: Option<PathBuf>,

    /// Seconds to wait for the server to accept connections
    #[arg(long, default_value = "60")]
    startup_timeout: u64,
}

impl RunArgs {
    /// Merge the optional config file and the flags into one record.
    fn instance_config(&self) -> anyhow::Result<InstanceConfig> {
        let mut config: InstanceConfig = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&json)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => InstanceConfig::default(),
        };

        if let Some(version) = &self.pg_version {
            config.version = version.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
            // Keep the default data directory keyed by the chosen port
            if self.config.is_none() && self.data_dir.is_none() {
                config.data_dir = pgembed_core::paths::default_data_dir(port);
            }
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(locale) = &self.locale {
            config.locale = locale.clone();
        }
        if let Some(charset) = &self.charset {
            config.charset = charset.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn scope(&self) -> anyhow::Result<CodeScope> {
        if let Some(library) = &self.library {
            return Ok(CodeScope::load_library(library)?);
        }

        let mut runner =
            PostgresRunner::new().with_startup_timeout(Duration::from_secs(self.startup_timeout));
        if let Some(bin_dir) = &self.bin_dir {
            runner = runner.with_bin_dir(bin_dir);
        }
        Ok(CodeScope::linked("postgres", runner))
    }
}

/// Requests to shut down: Ctrl+C everywhere, plus SIGTERM and SIGHUP on unix.
///
/// Listening replaces the default action of these signals, which would kill
/// the process without running the teardown or the exit hooks.
struct TerminationSignals {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl TerminationSignals {
    fn listen() -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?,
                terminate: signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?,
                hangup: signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next request; returns what was received.
    async fn recv(&mut self) -> anyhow::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Ok("interrupt"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
                _ = self.hangup.recv() => Ok("SIGHUP"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl+C")?;
            Ok("interrupt")
        }
    }
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let config = args.instance_config()?;
    let scope = args.scope()?;
    let mut signals = TerminationSignals::listen()?;

    println!(
        "\n{}pgembed{} {}",
        colors::BOLD,
        colors::RESET,
        config.instance_id()
    );
    println!("{}Scope: {}{}", colors::DIM, scope.name(), colors::RESET);
    println!(
        "{}Data:  {}{}",
        colors::DIM,
        config.data_dir.display(),
        colors::RESET
    );

    global::install(scope)?;

    let began = Instant::now();
    let interrupt = InterruptHandle::new();
    let mut start = tokio::task::spawn_blocking({
        let config = config.clone();
        let interrupt = interrupt.clone();
        move || global::start_with_interrupt(config, &interrupt)
    });

    tokio::select! {
        joined = &mut start => joined.context("start task panicked")??,
        received = signals.recv() => {
            println!(
                "\n{}Received {} during startup, stopping...{}",
                colors::YELLOW,
                received.unwrap_or("signal"),
                colors::RESET
            );
            interrupt.interrupt();
            // Surface the interrupt, but stop whatever may have come up
            let started = start.await.context("start task panicked")?;
            shutdown().await?;
            return started.map_err(Into::into);
        }
    }

    println!(
        "\n{}Ready{} in {:.2}s",
        colors::GREEN,
        colors::RESET,
        began.elapsed().as_secs_f64()
    );
    if let Some(info) = global::installed().and_then(|s| s.instance_info()) {
        if let Some(pid) = info.pid {
            println!("  pid:  {}", pid);
        }
    }
    println!(
        "  url:  postgresql://{}@{}:{}/{}",
        config.username, LISTEN_HOST, config.port, config.database
    );
    println!("\nPress Ctrl+C to stop");

    let received = signals.recv().await?;

    println!(
        "\n{}Received {}, stopping...{}",
        colors::YELLOW,
        received,
        colors::RESET
    );
    shutdown().await?;
    println!("{}Stopped{}", colors::GREEN, colors::RESET);

    Ok(())
}

async fn shutdown() -> anyhow::Result<()> {
    tokio::task::spawn_blocking(global::teardown)
        .await
        .context("stop task panicked")??;
    Ok(())
}
