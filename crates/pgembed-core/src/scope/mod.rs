//! Pinned code resolution scopes.
//!
//! A [`CodeScope`] is the code the supervisor uses to reach the runner.
//! Entry points are resolved exactly once, when the scope is built, and
//! the scope keeps whatever backs them (a linked runner or a loaded
//! library) alive for as long as any clone of it exists.
//!
//! ```text
//! CodeScope (Arc, cloned into the supervisor and its exit hook)
//!     │
//!     ├── linked: Box<dyn InstanceRunner> compiled into the host
//!     │
//!     └── library: LibraryRunner
//!             ├── pgembed_runner_start  (resolved at load)
//!             ├── pgembed_runner_stop   (resolved at load)
//!             └── Library (RTLD_NODELETE on Linux)
//! ```

pub mod ffi;
mod library;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::runner::InstanceRunner;

use library::LibraryRunner;

/// Handle to the code that starts and stops the instance.
///
/// Cloning is cheap and every clone resolves to the same runner, so
/// whatever started the instance through a scope can always stop it.
#[derive(Clone)]
pub struct CodeScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    name: String,
    runner: Box<dyn InstanceRunner>,
}

impl CodeScope {
    /// Pin a runner compiled into the host.
    pub fn linked(name: impl Into<String>, runner: impl InstanceRunner + 'static) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                runner: Box::new(runner),
            }),
        }
    }

    /// Load a runner library and resolve its entry points.
    ///
    /// Fails with `Error::Resolution` if the library cannot be loaded or
    /// does not export both entry points.
    pub fn load_library(path: impl AsRef<Path>) -> Result<Self> {
        let runner = LibraryRunner::load(path.as_ref())?;
        let name = runner.path().display().to_string();
        Ok(Self {
            inner: Arc::new(ScopeInner {
                name,
                runner: Box::new(runner),
            }),
        })
    }

    /// Scope name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The resolved runner.
    pub fn runner(&self) -> &dyn InstanceRunner {
        self.inner.runner.as_ref()
    }

    /// Whether two handles refer to the same pinned scope.
    pub fn same_scope(&self, other: &CodeScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CodeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeScope")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
