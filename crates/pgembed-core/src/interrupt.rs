//! Cooperative interruption of a caller waiting on the start worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for interrupting a blocked `start`.
///
/// `InterruptHandle` can be cloned and shared across threads; any clone can
/// trigger the interrupt and all other clones observe it. Interrupting only
/// stops the caller's wait. The start routine already running on the
/// worker is left to finish.
///
/// # Example
///
/// ```
/// use pgembed_core::InterruptHandle;
///
/// let handle = InterruptHandle::new();
/// let from_signal_handler = handle.clone();
///
/// assert!(!handle.is_interrupted());
/// from_signal_handler.interrupt();
/// assert!(handle.is_interrupted());
/// ```
#[derive(Clone, Default)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Create a new, unset handle.
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if an interrupt has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Request the interrupt.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Clear the flag before reusing the handle.
    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}
