//! Process-wide supervisor.
//!
//! A single installed [`IsolatedSupervisor`] reachable through free
//! functions, so code that did not create the supervisor (a shutdown path,
//! another loaded module through `pgembed_global_stop`) can still stop the
//! instance through its pinned scope.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::interrupt::InterruptHandle;
use crate::scope::CodeScope;
use crate::scope::ffi::ScopeStatus;
use crate::supervisor::IsolatedSupervisor;

static SUPERVISOR: Mutex<Option<IsolatedSupervisor>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<IsolatedSupervisor>> {
    SUPERVISOR.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install the process-wide supervisor for `scope`.
pub fn install(scope: CodeScope) -> Result<IsolatedSupervisor> {
    let mut slot = slot();
    if slot.is_some() {
        return Err(Error::AlreadyInstalled);
    }

    tracing::debug!(scope = scope.name(), "installing process-wide supervisor");
    let supervisor = IsolatedSupervisor::new(scope);
    *slot = Some(supervisor.clone());
    Ok(supervisor)
}

/// The installed supervisor, if any.
pub fn installed() -> Option<IsolatedSupervisor> {
    slot().clone()
}

/// Start the instance on the installed supervisor.
pub fn start(config: InstanceConfig) -> Result<()> {
    start_with_interrupt(config, &InterruptHandle::new())
}

/// Start the instance on the installed supervisor, interruptibly.
pub fn start_with_interrupt(config: InstanceConfig, interrupt: &InterruptHandle) -> Result<()> {
    // Never hold the slot lock across the blocking start
    let supervisor = installed().ok_or(Error::NotInstalled)?;
    supervisor.start_with_interrupt(config, interrupt)
}

/// Stop the instance on the installed supervisor.
///
/// With nothing installed there is nothing to stop, so this returns
/// `Ok(())`.
pub fn stop() -> Result<()> {
    match installed() {
        Some(supervisor) => supervisor.stop(),
        None => {
            tracing::debug!("no supervisor installed, nothing to stop");
            Ok(())
        }
    }
}

/// Stop the instance and uninstall the supervisor.
///
/// If the stop fails the supervisor stays installed so it can be retried
/// (its exit hook also remains pending).
pub fn teardown() -> Result<()> {
    let Some(supervisor) = installed() else {
        return Ok(());
    };

    supervisor.stop()?;

    let mut slot = slot();
    let same = slot
        .as_ref()
        .is_some_and(|current| current.is_same(&supervisor));
    if same {
        *slot = None;
    }
    Ok(())
}

/// Stop the installed supervisor from another loaded module.
///
/// Returns `0` on success (including when nothing is installed) and `-2`
/// when the runner failed to stop.
#[unsafe(no_mangle)]
pub extern "C" fn pgembed_global_stop() -> i32 {
    let result = std::panic::catch_unwind(stop);
    match result {
        Ok(Ok(())) => ScopeStatus::Success as i32,
        Ok(Err(e)) => {
            tracing::error!("{}", e.with_hint());
            ScopeStatus::RunnerError as i32
        }
        Err(_) => ScopeStatus::Panic as i32,
    }
}
