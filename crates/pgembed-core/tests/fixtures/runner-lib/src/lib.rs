//! Runner library used by the library-scope tests.
//!
//! Starting binds a TCP listener on the configured port and stopping drops
//! it. A database named `flaky-stop` makes the first stop fail once.

use std::io;
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pgembed_core::{InstanceConfig, InstanceInfo, InstanceRunner, RunnerError};

/// Database name whose first stop is refused.
const FLAKY_STOP_DATABASE: &str = "flaky-stop";

#[derive(Default)]
struct ListenerRunner {
    state: Mutex<Option<Listening>>,
}

struct Listening {
    listener: TcpListener,
    refuse_next_stop: bool,
}

impl ListenerRunner {
    fn state(&self) -> MutexGuard<'_, Option<Listening>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceRunner for ListenerRunner {
    fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
        let mut state = self.state();
        if let Some(current) = state.as_ref() {
            let port = current.listener.local_addr().map(|a| a.port()).unwrap_or(config.port);
            return Err(RunnerError::AlreadyRunning(port));
        }

        let listener = TcpListener::bind(("127.0.0.1", config.port)).map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                RunnerError::PortInUse {
                    port: config.port,
                    source,
                }
            } else {
                RunnerError::Io(source)
            }
        })?;

        *state = Some(Listening {
            listener,
            refuse_next_stop: config.database == FLAKY_STOP_DATABASE,
        });

        Ok(InstanceInfo {
            port: config.port,
            pid: Some(std::process::id()),
            data_dir: config.data_dir.clone(),
        })
    }

    fn stop(&self) -> Result<(), RunnerError> {
        let mut state = self.state();
        if let Some(current) = state.as_mut() {
            if current.refuse_next_stop {
                current.refuse_next_stop = false;
                return Err(RunnerError::Command {
                    program: "pg_ctl".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "could not send stop signal".to_string(),
                });
            }
        }
        state.take();
        Ok(())
    }
}

pgembed_core::export_instance_runner!(ListenerRunner::default());
