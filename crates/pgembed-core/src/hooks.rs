//! Process-exit hooks.
//!
//! Hooks registered here run when the process exits normally, through a
//! single `atexit` trampoline installed on first registration. The
//! supervisor registers its stop routine here so an instance started by a
//! caller that never reaches its own stop path is still shut down.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use crate::runner::panic_message;

type Hook = Box<dyn FnOnce() + Send>;

/// Identifier of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

struct Entry {
    id: HookId,
    name: String,
    hook: Hook,
}

/// Set of named one-shot hooks.
///
/// Every hook is taken out of the registry before it runs, so a hook runs
/// at most once no matter how many paths try to fire it.
pub struct HookRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a hook.
    pub fn register(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        tracing::debug!(%id, %name, "registered exit hook");
        self.entries().push(Entry {
            id,
            name,
            hook: Box::new(hook),
        });
        id
    }

    /// Remove a hook without running it. Returns whether it was registered.
    pub fn deregister(&self, id: HookId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Run a single hook now. Returns whether it was registered.
    pub fn run(&self, id: HookId) -> bool {
        let entry = {
            let mut entries = self.entries();
            let Some(pos) = entries.iter().position(|entry| entry.id == id) else {
                return false;
            };
            entries.remove(pos)
        };
        Self::invoke(entry);
        true
    }

    /// Run every registered hook, most recently registered first.
    ///
    /// Returns the number of hooks run. A panicking hook is logged and does
    /// not prevent the remaining hooks from running.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        // Pop one at a time so hooks may touch the registry themselves
        loop {
            let entry = self.entries().pop();
            let Some(entry) = entry else {
                return count;
            };
            Self::invoke(entry);
            count += 1;
        }
    }

    /// Number of pending hooks.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no hooks are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn invoke(entry: Entry) {
        let Entry { id, name, hook } = entry;
        tracing::debug!(%id, %name, "running exit hook");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
            tracing::error!(
                "Exit hook {} ({}) panicked: {}",
                id,
                name,
                panic_message(payload.as_ref())
            );
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: HookRegistry = HookRegistry::new();
static INSTALL: Once = Once::new();

/// Register a hook to run at process exit.
pub fn register(name: impl Into<String>, hook: impl FnOnce() + Send + 'static) -> HookId {
    install_exit_handler();
    REGISTRY.register(name, hook)
}

/// Remove a process-exit hook without running it.
pub fn deregister(id: HookId) -> bool {
    REGISTRY.deregister(id)
}

/// Run one process-exit hook now instead of at exit.
pub fn run(id: HookId) -> bool {
    REGISTRY.run(id)
}

/// Run all pending process-exit hooks now.
pub fn run_all() -> usize {
    REGISTRY.run_all()
}

/// Whether `id` is still pending.
pub fn is_registered(id: HookId) -> bool {
    REGISTRY.entries().iter().any(|entry| entry.id == id)
}

fn install_exit_handler() {
    INSTALL.call_once(|| {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::atexit(run_at_exit) };
            if rc != 0 {
                tracing::warn!("Failed to install exit handler; hooks will only run when fired explicitly");
            }
        }

        #[cfg(not(unix))]
        tracing::debug!("No exit handler on this platform; hooks run only when fired explicitly");
    });
}

#[cfg(unix)]
extern "C" fn run_at_exit() {
    // Unwinding out of an extern "C" fn aborts the process
    let _ = catch_unwind(|| REGISTRY.run_all());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_all_is_lifo() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let order = order.clone();
            registry.register(format!("hook {}", i), move || order.lock().unwrap().push(i));
        }

        assert_eq!(registry.run_all(), 3);
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_hooks_run_once() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let id = registry.register("once", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.run(id));
        assert!(!registry.run(id));
        assert_eq!(registry.run_all(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deregister_skips_hook() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let id = registry.register("skipped", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        registry.run_all();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_hook_does_not_block_others() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        registry.register("survivor", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.register("panics", || panic!("hook failure"));

        assert_eq!(registry.run_all(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_may_deregister_itself_while_running() {
        let registry = Arc::new(HookRegistry::new());
        let inner = registry.clone();
        let slot = Arc::new(Mutex::new(None));
        let slot_in_hook = slot.clone();

        let id = registry.register("self-deregistering", move || {
            let id = slot_in_hook.lock().unwrap().take();
            if let Some(id) = id {
                assert!(!inner.deregister(id));
            }
        });
        *slot.lock().unwrap() = Some(id);

        assert!(registry.run(id));
    }

    #[test]
    fn test_global_register_and_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let id = register("global", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(is_registered(id));
        assert!(run(id));
        assert!(!is_registered(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
