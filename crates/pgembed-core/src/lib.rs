//! Isolated lifecycle supervision for a locally spawned PostgreSQL server.
//!
//! This crate provides:
//! - An instance runner contract and a PostgreSQL implementation
//! - Pinned code scopes (linked runners and dynamically loaded libraries)
//! - A supervisor that starts on a dedicated worker and stops through the
//!   same scope, from any thread
//! - Process-exit hooks that stop instances the caller never stopped
//! - A process-wide supervisor with a C entry point for other modules

pub mod config;
pub mod error;
pub mod global;
pub mod hooks;
pub mod interrupt;
pub mod paths;
pub mod runner;
pub mod scope;
pub mod supervisor;

pub use config::InstanceConfig;
pub use error::{Error, Result};
pub use interrupt::InterruptHandle;
pub use runner::{InstanceInfo, InstanceRunner, PgBinaries, PostgresRunner, RunnerError};
pub use scope::CodeScope;
pub use supervisor::{IsolatedSupervisor, SupervisorState};
