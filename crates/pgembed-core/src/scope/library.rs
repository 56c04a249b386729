//! Runner living in a dynamically loaded library.

use std::path::{Path, PathBuf};

use libloading::Library;

use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::runner::{InstanceInfo, InstanceRunner, RunnerError};

use super::ffi::{FfiBuffer, START_SYMBOL, STOP_SYMBOL, ScopeStatus, StartFn, StopFn, decode_error};

/// Runner whose entry points were resolved from a loaded library.
///
/// The function pointers are only valid while `_library` is loaded, so the
/// library is owned here and dropped last.
pub(crate) struct LibraryRunner {
    path: PathBuf,
    start_fn: StartFn,
    stop_fn: StopFn,
    _library: Library,
}

impl LibraryRunner {
    /// Load `path` and resolve both entry points.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let scope = path.display().to_string();
        let library = open_pinned(path).map_err(|e| Error::Resolution {
            scope: scope.clone(),
            symbol: "<library>".to_string(),
            message: e.to_string(),
        })?;

        let start_fn: StartFn = unsafe {
            *library.get::<StartFn>(START_SYMBOL.as_bytes()).map_err(|e| Error::Resolution {
                scope: scope.clone(),
                symbol: START_SYMBOL.to_string(),
                message: e.to_string(),
            })?
        };
        let stop_fn: StopFn = unsafe {
            *library.get::<StopFn>(STOP_SYMBOL.as_bytes()).map_err(|e| Error::Resolution {
                scope: scope.clone(),
                symbol: STOP_SYMBOL.to_string(),
                message: e.to_string(),
            })?
        };

        tracing::debug!(scope = %scope, "resolved runner entry points");

        Ok(Self {
            path: path.to_path_buf(),
            start_fn,
            stop_fn,
            _library: library,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Open a library so that its code stays mapped until process exit.
#[cfg(target_os = "linux")]
fn open_pinned(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::Library as UnixLibrary;

    let library = unsafe {
        UnixLibrary::open(Some(path), libc::RTLD_NOW | libc::RTLD_LOCAL | libc::RTLD_NODELETE)?
    };
    Ok(library.into())
}

#[cfg(not(target_os = "linux"))]
fn open_pinned(path: &Path) -> std::result::Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

impl InstanceRunner for LibraryRunner {
    fn start(&self, config: &InstanceConfig) -> std::result::Result<InstanceInfo, RunnerError> {
        let config_json = serde_json::to_vec(config)?;
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status = unsafe {
            (self.start_fn)(
                config_json.as_ptr(),
                config_json.len(),
                &mut out_ptr,
                &mut out_len,
            )
        };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        match ScopeStatus::from(status) {
            ScopeStatus::Success => Ok(serde_json::from_slice(out.as_slice())?),
            _ => Err(decode_error(status, &out, Some(config.port))),
        }
    }

    fn stop(&self) -> std::result::Result<(), RunnerError> {
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status = unsafe { (self.stop_fn)(&mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        match ScopeStatus::from(status) {
            ScopeStatus::Success => Ok(()),
            _ => Err(decode_error(status, &out, None)),
        }
    }
}
