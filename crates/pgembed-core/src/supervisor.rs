//! Isolated execution supervisor.
//!
//! Starts the instance on a dedicated worker thread that holds the pinned
//! [`CodeScope`], and stops it through that same scope. The process-exit
//! hook registered by the worker owns a reference to the supervisor, so
//! the code needed to stop the server stays reachable after every caller
//! handle is gone.
//!
//! ```text
//! caller ── start(config) ──► worker "postgres-embedded"
//!   │ (blocks, polls interrupt)     │
//!   │                               ├── scope.runner().start(config)
//!   │                               └── hooks::register(stop via scope)
//!   ◄──────── result ───────────────┘
//!
//! caller / exit hook ── stop() ──► scope.runner().stop()
//! ```

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::hooks::{self, HookId};
use crate::interrupt::InterruptHandle;
use crate::runner::{InstanceInfo, RunnerError, panic_message};
use crate::scope::CodeScope;

/// Name of the dedicated start thread.
pub const WORKER_THREAD_NAME: &str = "postgres-embedded";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of the supervised instance.
///
/// ```text
/// Idle ──► Starting ──► Running ──► Stopping ──► Stopped
///              │
///              └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Start failed. Terminal; a best-effort stop is still allowed.
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supervises exactly one instance through a pinned code scope.
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct IsolatedSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    scope: CodeScope,
    poll_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: SupervisorState,
    instance: Option<String>,
    info: Option<InstanceInfo>,
    exit_hook: Option<HookId>,
}

impl IsolatedSupervisor {
    /// Create a supervisor bound to `scope` for its whole lifetime.
    pub fn new(scope: CodeScope) -> Self {
        Self::with_poll_interval(scope, DEFAULT_POLL_INTERVAL)
    }

    /// Like [`new`](Self::new), with a custom interval at which a waiting
    /// caller checks its interrupt handle.
    pub fn with_poll_interval(scope: CodeScope, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                poll_interval,
                lifecycle: Mutex::new(Lifecycle {
                    state: SupervisorState::Idle,
                    instance: None,
                    info: None,
                    exit_hook: None,
                }),
            }),
        }
    }

    /// Interval at which a waiting caller checks its interrupt handle.
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// The pinned scope.
    pub fn scope(&self) -> &CodeScope {
        &self.inner.scope
    }

    /// Whether both handles refer to the same supervisor.
    pub fn is_same(&self, other: &IsolatedSupervisor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.inner.lifecycle().state
    }

    /// What the runner reported for the running instance.
    pub fn instance_info(&self) -> Option<InstanceInfo> {
        self.inner.lifecycle().info.clone()
    }

    /// Exit hook registered by the last start, if still pending.
    pub fn exit_hook(&self) -> Option<HookId> {
        self.inner.lifecycle().exit_hook
    }

    /// Start the instance and block until the worker's start routine ends.
    pub fn start(&self, config: InstanceConfig) -> Result<()> {
        self.start_with_interrupt(config, &InterruptHandle::new())
    }

    /// Like [`start`](Self::start), but the wait ends with
    /// `Error::Interrupted` once `interrupt` is set.
    ///
    /// An interrupted start is not cancelled: the worker finishes on its own
    /// and its exit hook still stops whatever it brought up.
    pub fn start_with_interrupt(
        &self,
        config: InstanceConfig,
        interrupt: &InterruptHandle,
    ) -> Result<()> {
        config.validate()?;
        let instance = config.instance_id();

        {
            let mut life = self.inner.lifecycle();
            if life.state != SupervisorState::Idle {
                return Err(Error::InvalidState {
                    operation: "start",
                    state: life.state,
                });
            }
            life.state = SupervisorState::Starting;
            life.instance = Some(instance.clone());
        }

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = inner.run_start(&config);
                // The caller may have stopped listening after an interrupt
                let _ = tx.send(result);
            });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.inner.lifecycle().state = SupervisorState::Failed;
                return Err(Error::Io(e));
            }
        };

        loop {
            if interrupt.is_interrupted() {
                tracing::warn!(%instance, "interrupted while waiting for start worker");
                return Err(Error::Interrupted { instance });
            }

            match rx.recv_timeout(self.inner.poll_interval) {
                Ok(result) => {
                    let _ = worker.join();
                    return result;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let message = match worker.join() {
                        Err(payload) => panic_message(payload.as_ref()),
                        Ok(()) => "start worker exited without reporting".to_string(),
                    };
                    self.inner.lifecycle().state = SupervisorState::Failed;
                    return Err(Error::Start {
                        instance,
                        source: RunnerError::Panicked(message),
                    });
                }
            }
        }
    }

    /// Stop the instance through the pinned scope.
    ///
    /// Safe from any thread and from the exit hook. From `Idle`, `Stopped`
    /// or `Failed` the call is still forwarded to the runner, which treats
    /// stopping a non-running instance as a no-op.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }
}

impl fmt::Debug for IsolatedSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedSupervisor")
            .field("scope", &self.inner.scope)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start routine, runs on the worker thread.
    fn run_start(self: &Arc<Self>, config: &InstanceConfig) -> Result<()> {
        let instance = config.instance_id();
        tracing::info!(scope = self.scope.name(), %instance, "starting instance");

        let result = self.scope.runner().start(config);

        // Registered whatever the outcome: a partial start still gets a
        // best-effort stop at exit
        let hook_owner = Arc::clone(self);
        let hook = hooks::register(format!("stop {}", instance), move || {
            if let Err(e) = hook_owner.stop() {
                tracing::error!("Exit hook failed to stop instance: {}", e.with_hint());
            }
        });

        let mut life = self.lifecycle();
        if let Some(previous) = life.exit_hook.replace(hook) {
            hooks::deregister(previous);
        }

        match result {
            Ok(info) => {
                if life.state == SupervisorState::Starting {
                    life.state = SupervisorState::Running;
                }
                tracing::info!(%instance, pid = ?info.pid, "instance running");
                life.info = Some(info);
                Ok(())
            }
            Err(source) => {
                if life.state == SupervisorState::Starting {
                    life.state = SupervisorState::Failed;
                }
                Err(Error::Start { instance, source })
            }
        }
    }

    fn stop(&self) -> Result<()> {
        let (previous, instance) = {
            let mut life = self.lifecycle();
            let previous = life.state;
            if matches!(previous, SupervisorState::Starting | SupervisorState::Running) {
                life.state = SupervisorState::Stopping;
            }
            let instance = life
                .instance
                .clone()
                .unwrap_or_else(|| format!("instance in scope {}", self.scope.name()));
            (previous, instance)
        };

        tracing::info!(scope = self.scope.name(), %instance, state = %previous, "stopping instance");

        match self.scope.runner().stop() {
            Ok(()) => {
                let mut life = self.lifecycle();
                if matches!(
                    previous,
                    SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping
                ) {
                    life.state = SupervisorState::Stopped;
                }
                life.info = None;
                if let Some(hook) = life.exit_hook.take() {
                    hooks::deregister(hook);
                }
                Ok(())
            }
            Err(source) => {
                let mut life = self.lifecycle();
                if life.state == SupervisorState::Stopping && previous != SupervisorState::Stopping {
                    life.state = previous;
                }
                Err(Error::Stop { instance, source })
            }
        }
    }
}
