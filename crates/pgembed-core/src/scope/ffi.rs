//! FFI contract between the supervisor and a runner library.
//!
//! A runner library exports two C ABI functions. Both write their result
//! into an out buffer allocated with `libc::malloc`; the caller frees it
//! with `libc::free`.
//!
//! ```text
//! pgembed_runner_start(config_ptr, config_len, out_ptr, out_len) -> i32
//!     config: InstanceConfig as JSON
//!     out:    InstanceInfo as JSON on success, error message otherwise
//!
//! pgembed_runner_stop(out_ptr, out_len) -> i32
//!     out:    error message on failure, empty on success
//! ```
//!
//! Errors the host knows how to act on keep their kind through a dedicated
//! status code: `-4` carries the bind error of a port conflict, `-5` the
//! name of a missing binary.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::config::InstanceConfig;
use crate::runner::{InstanceRunner, RunnerError, panic_message};

/// Symbol name of the start entry point.
pub const START_SYMBOL: &str = "pgembed_runner_start";

/// Symbol name of the stop entry point.
pub const STOP_SYMBOL: &str = "pgembed_runner_stop";

/// Start entry point: config JSON in, `InstanceInfo` JSON or error out.
pub type StartFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;

/// Stop entry point: error message out on failure.
pub type StopFn = unsafe extern "C" fn(*mut *mut u8, *mut usize) -> i32;

/// Status code returned by runner entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ScopeStatus {
    /// Operation succeeded
    Success = 0,
    /// Configuration could not be decoded
    InvalidConfig = -1,
    /// The runner returned an error
    RunnerError = -2,
    /// The runner panicked
    Panic = -3,
    /// The configured port is already in use
    PortInUse = -4,
    /// A required engine binary is missing
    BinaryNotFound = -5,
}

impl From<i32> for ScopeStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::InvalidConfig,
            -3 => Self::Panic,
            -4 => Self::PortInUse,
            -5 => Self::BinaryNotFound,
            _ => Self::RunnerError, // Unknown codes treated as runner errors
        }
    }
}

/// RAII guard for memory handed over by a runner library.
/// Ensures libc::free is called even if decoding fails.
pub(crate) struct FfiBuffer {
    ptr: *mut u8,
    len: usize,
}

impl FfiBuffer {
    /// # Safety
    /// `ptr` must be null or a `libc::malloc` allocation of at least `len` bytes.
    pub(crate) unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub(crate) fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }
}

impl Drop for FfiBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::free(self.ptr as *mut libc::c_void);
            }
        }
    }
}

/// Copy `bytes` into a fresh `malloc` allocation and publish it.
///
/// # Safety
/// `out_ptr` and `out_len` must be valid for writes or null.
unsafe fn write_out(bytes: &[u8], out_ptr: *mut *mut u8, out_len: *mut usize) {
    if out_ptr.is_null() || out_len.is_null() {
        return;
    }

    unsafe {
        *out_ptr = std::ptr::null_mut();
        *out_len = 0;
        if bytes.is_empty() {
            return;
        }

        let buf = libc::malloc(bytes.len()) as *mut u8;
        if buf.is_null() {
            return;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
        *out_ptr = buf;
        *out_len = bytes.len();
    }
}

/// Library side of `pgembed_runner_start`.
///
/// # Safety
/// `config_ptr` must point to `config_len` readable bytes; `out_ptr` and
/// `out_len` must be valid for writes.
pub unsafe fn dispatch_start(
    runner: &dyn InstanceRunner,
    config_ptr: *const u8,
    config_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let config_bytes = if config_ptr.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(config_ptr, config_len) }
    };

    let config: InstanceConfig = match serde_json::from_slice(config_bytes) {
        Ok(config) => config,
        Err(e) => {
            unsafe { write_out(e.to_string().as_bytes(), out_ptr, out_len) };
            return ScopeStatus::InvalidConfig as i32;
        }
    };

    let (status, payload) = match catch_unwind(AssertUnwindSafe(|| runner.start(&config))) {
        Ok(Ok(info)) => match serde_json::to_vec(&info) {
            Ok(json) => (ScopeStatus::Success, json),
            Err(e) => (ScopeStatus::RunnerError, e.to_string().into_bytes()),
        },
        Ok(Err(e)) => encode_error(&e),
        Err(payload) => (ScopeStatus::Panic, panic_message(payload.as_ref()).into_bytes()),
    };

    unsafe { write_out(&payload, out_ptr, out_len) };
    status as i32
}

/// Library side of `pgembed_runner_stop`.
///
/// # Safety
/// `out_ptr` and `out_len` must be valid for writes.
pub unsafe fn dispatch_stop(
    runner: &dyn InstanceRunner,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let (status, payload) = match catch_unwind(AssertUnwindSafe(|| runner.stop())) {
        Ok(Ok(())) => (ScopeStatus::Success, Vec::new()),
        Ok(Err(e)) => encode_error(&e),
        Err(payload) => (ScopeStatus::Panic, panic_message(payload.as_ref()).into_bytes()),
    };

    unsafe { write_out(&payload, out_ptr, out_len) };
    status as i32
}

fn encode_error(err: &RunnerError) -> (ScopeStatus, Vec<u8>) {
    match err {
        RunnerError::PortInUse { source, .. } => {
            (ScopeStatus::PortInUse, source.to_string().into_bytes())
        }
        RunnerError::BinaryNotFound(name) => {
            (ScopeStatus::BinaryNotFound, name.clone().into_bytes())
        }
        _ => (ScopeStatus::RunnerError, render_chain(err).into_bytes()),
    }
}

/// Rebuild the runner error a library reported with `status`.
///
/// `port` is the port of the start request, if any; a port conflict without
/// one is reported as a plain library error.
pub(crate) fn decode_error(status: i32, out: &FfiBuffer, port: Option<u16>) -> RunnerError {
    let message = out.to_string_lossy();
    match (ScopeStatus::from(status), port) {
        (ScopeStatus::InvalidConfig, _) => RunnerError::InvalidConfig(message),
        (ScopeStatus::Panic, _) => RunnerError::Panicked(message),
        (ScopeStatus::PortInUse, Some(port)) => RunnerError::PortInUse {
            port,
            source: io::Error::new(io::ErrorKind::AddrInUse, message),
        },
        (ScopeStatus::BinaryNotFound, _) => RunnerError::BinaryNotFound(message),
        _ => RunnerError::Library { status, message },
    }
}

fn render_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        rendered.push_str(": ");
        rendered.push_str(&e.to_string());
        cause = e.source();
    }
    rendered
}

/// Export an [`InstanceRunner`] from a `cdylib` so it can be loaded with
/// `CodeScope::load_library`.
///
/// The constructor expression runs once, on first use.
///
/// # Usage
/// ```ignore
/// pgembed_core::export_instance_runner!(pgembed_core::PostgresRunner::new());
/// ```
#[macro_export]
macro_rules! export_instance_runner {
    ($ctor:expr) => {
        fn __pgembed_exported_runner() -> &'static dyn $crate::InstanceRunner {
            static RUNNER: ::std::sync::OnceLock<::std::boxed::Box<dyn $crate::InstanceRunner>> =
                ::std::sync::OnceLock::new();
            RUNNER.get_or_init(|| ::std::boxed::Box::new($ctor)).as_ref()
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn pgembed_runner_start(
            config_ptr: *const u8,
            config_len: usize,
            out_ptr: *mut *mut u8,
            out_len: *mut usize,
        ) -> i32 {
            unsafe {
                $crate::scope::ffi::dispatch_start(
                    __pgembed_exported_runner(),
                    config_ptr,
                    config_len,
                    out_ptr,
                    out_len,
                )
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn pgembed_runner_stop(out_ptr: *mut *mut u8, out_len: *mut usize) -> i32 {
            unsafe { $crate::scope::ffi::dispatch_stop(__pgembed_exported_runner(), out_ptr, out_len) }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runner::InstanceInfo;

    struct CountingRunner {
        stops: AtomicUsize,
        fail_start: bool,
    }

    impl InstanceRunner for CountingRunner {
        fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
            if self.fail_start {
                return Err(RunnerError::AlreadyRunning(config.port));
            }
            Ok(InstanceInfo {
                port: config.port,
                pid: Some(7),
                data_dir: config.data_dir.clone(),
            })
        }

        fn stop(&self) -> Result<(), RunnerError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config_json() -> Vec<u8> {
        let config = InstanceConfig {
            port: 15432,
            data_dir: PathBuf::from("/tmp/ffi"),
            ..InstanceConfig::default()
        };
        serde_json::to_vec(&config).unwrap()
    }

    #[test]
    fn test_scope_status_from_i32() {
        assert_eq!(ScopeStatus::from(0), ScopeStatus::Success);
        assert_eq!(ScopeStatus::from(-1), ScopeStatus::InvalidConfig);
        assert_eq!(ScopeStatus::from(-2), ScopeStatus::RunnerError);
        assert_eq!(ScopeStatus::from(-3), ScopeStatus::Panic);
        assert_eq!(ScopeStatus::from(-4), ScopeStatus::PortInUse);
        assert_eq!(ScopeStatus::from(-5), ScopeStatus::BinaryNotFound);
        assert_eq!(ScopeStatus::from(-99), ScopeStatus::RunnerError);
    }

    #[test]
    fn test_dispatch_start_writes_instance_info() {
        let runner = CountingRunner {
            stops: AtomicUsize::new(0),
            fail_start: false,
        };
        let json = config_json();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status =
            unsafe { dispatch_start(&runner, json.as_ptr(), json.len(), &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::Success);
        let info: InstanceInfo = serde_json::from_slice(out.as_slice()).unwrap();
        assert_eq!(info.port, 15432);
        assert_eq!(info.pid, Some(7));
    }

    #[test]
    fn test_dispatch_start_reports_runner_error() {
        let runner = CountingRunner {
            stops: AtomicUsize::new(0),
            fail_start: true,
        };
        let json = config_json();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status =
            unsafe { dispatch_start(&runner, json.as_ptr(), json.len(), &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::RunnerError);
        assert!(out.to_string_lossy().contains("already running on port 15432"));
    }

    #[test]
    fn test_dispatch_start_rejects_bad_config() {
        let runner = CountingRunner {
            stops: AtomicUsize::new(0),
            fail_start: false,
        };
        let json = b"{not json";
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status =
            unsafe { dispatch_start(&runner, json.as_ptr(), json.len(), &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::InvalidConfig);
        assert!(!out.as_slice().is_empty());
    }

    #[test]
    fn test_port_conflict_keeps_its_kind_across_the_boundary() {
        struct BusyPortRunner;

        impl InstanceRunner for BusyPortRunner {
            fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
                Err(RunnerError::PortInUse {
                    port: config.port,
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                })
            }

            fn stop(&self) -> Result<(), RunnerError> {
                Err(RunnerError::BinaryNotFound("pg_ctl".to_string()))
            }
        }

        let json = config_json();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let status = unsafe {
            dispatch_start(&BusyPortRunner, json.as_ptr(), json.len(), &mut out_ptr, &mut out_len)
        };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::PortInUse);
        match decode_error(status, &out, Some(15432)) {
            RunnerError::PortInUse { port, source } => {
                assert_eq!(port, 15432);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected PortInUse, got {:?}", other),
        }
        // Without a start request there is no port to attach
        assert!(matches!(
            decode_error(status, &out, None),
            RunnerError::Library { status: -4, .. }
        ));

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let status = unsafe { dispatch_stop(&BusyPortRunner, &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::BinaryNotFound);
        match decode_error(status, &out, None) {
            RunnerError::BinaryNotFound(name) => assert_eq!(name, "pg_ctl"),
            other => panic!("expected BinaryNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_stop_success_has_empty_buffer() {
        let runner = CountingRunner {
            stops: AtomicUsize::new(0),
            fail_start: false,
        };
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let status = unsafe { dispatch_stop(&runner, &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::Success);
        assert!(out.as_slice().is_empty());
        assert_eq!(runner.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_catches_panics() {
        struct PanickingRunner;

        impl InstanceRunner for PanickingRunner {
            fn start(&self, _config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
                panic!("start exploded");
            }

            fn stop(&self) -> Result<(), RunnerError> {
                panic!("stop exploded");
            }
        }

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let status = unsafe { dispatch_stop(&PanickingRunner, &mut out_ptr, &mut out_len) };
        let out = unsafe { FfiBuffer::new(out_ptr, out_len) };

        assert_eq!(ScopeStatus::from(status), ScopeStatus::Panic);
        assert_eq!(out.to_string_lossy(), "stop exploded");
    }
}
