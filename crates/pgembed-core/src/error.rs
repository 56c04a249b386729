//! Error types for pgembed-core.

use thiserror::Error;

use crate::runner::RunnerError;
use crate::supervisor::SupervisorState;

/// Result type for pgembed-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the supervisor and its entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// The pinned code scope cannot provide a required entry point.
    ///
    /// This is a packaging or wiring defect and is never retried.
    #[error("failed to resolve `{symbol}` in code scope {scope}: {message}")]
    Resolution {
        scope: String,
        symbol: String,
        message: String,
    },

    /// The runner failed to bring the instance up.
    #[error("failed to start {instance}")]
    Start {
        instance: String,
        #[source]
        source: RunnerError,
    },

    /// The runner failed to terminate the instance cleanly.
    #[error("failed to stop {instance}")]
    Stop {
        instance: String,
        #[source]
        source: RunnerError,
    },

    /// The caller stopped waiting for the start worker.
    #[error("interrupted while waiting for {instance} to start")]
    Interrupted { instance: String },

    /// Operation not allowed in the supervisor's current state.
    #[error("cannot {operation} while supervisor is {state}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },

    /// Instance configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No process-wide supervisor has been installed.
    #[error("no supervisor installed")]
    NotInstalled,

    /// A process-wide supervisor is already installed.
    #[error("a supervisor is already installed")]
    AlreadyInstalled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Render the error together with a recovery hint, when one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Resolution { .. } => Some(
                "the runner library must export `pgembed_runner_start` and `pgembed_runner_stop` \
                 (see `export_instance_runner!`)",
            ),
            Error::Start {
                source: RunnerError::PortInUse { .. },
                ..
            } => Some("pick a free port or stop the process currently listening on it"),
            Error::Start {
                source: RunnerError::BinaryNotFound(_),
                ..
            } => Some("pass --bin-dir or set PGEMBED_BIN_DIR to the PostgreSQL bin directory"),
            Error::Interrupted { .. } => {
                Some("the server state is unknown; run a stop before starting again")
            }
            Error::InvalidState { .. } => {
                Some("a supervisor manages exactly one instance; create a new one to start again")
            }
            _ => None,
        };

        let mut rendered = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            rendered.push_str(": ");
            rendered.push_str(&err.to_string());
            cause = err.source();
        }

        match hint {
            Some(hint) => format!("{rendered}\n  hint: {hint}"),
            None => rendered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_includes_cause_chain() {
        let err = Error::Start {
            instance: "testdb@127.0.0.1:15432".to_string(),
            source: RunnerError::PortInUse {
                port: 15432,
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            },
        };

        let rendered = err.with_hint();
        assert!(rendered.starts_with("failed to start testdb@127.0.0.1:15432: port 15432"));
        assert!(rendered.contains("hint: pick a free port"));
    }

    #[test]
    fn test_hint_absent_for_plain_errors() {
        let err = Error::Config("port must be non-zero".to_string());
        assert_eq!(err.with_hint(), "invalid configuration: port must be non-zero");
    }
}
