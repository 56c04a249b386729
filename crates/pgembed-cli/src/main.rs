//! pgembed CLI - supervise an embedded PostgreSQL instance.

mod check;
mod colors;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pgembed")]
#[command(about = "Run a local PostgreSQL server under an isolated supervisor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an instance and keep it running until Ctrl+C
    Run(run::RunArgs),

    /// Check that a runner library exports both entry points
    Check {
        /// Path to the dynamic library
        #[arg(long)]
        library: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Core errors carry recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<pgembed_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run(args) => run::execute(args).await.map_err(format_error)?,
        Commands::Check { library } => check::execute(&library).map_err(format_error)?,
    }

    Ok(())
}
