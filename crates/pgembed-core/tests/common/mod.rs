//! Shared test runners.
//!
//! `LoopbackRunner` stands in for the engine: starting binds a TCP listener
//! on the configured port, stopping drops it. That is enough to observe
//! "reachable after start, refused after stop" without PostgreSQL.

#![allow(dead_code)]

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use pgembed_core::{InstanceConfig, InstanceInfo, InstanceRunner, RunnerError};

#[derive(Default)]
pub struct LoopbackRunner {
    listener: Mutex<Option<TcpListener>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl LoopbackRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner whose start blocks until `gate` is opened.
    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

impl InstanceRunner for LoopbackRunner {
    fn start(&self, config: &InstanceConfig) -> Result<InstanceInfo, RunnerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
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
        *self.listener.lock().unwrap() = Some(listener);

        Ok(InstanceInfo {
            port: config.port,
            pid: Some(std::process::id()),
            data_dir: config.data_dir.clone(),
        })
    }

    fn stop(&self) -> Result<(), RunnerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.listener.lock().unwrap().take();
        Ok(())
    }
}

/// One-shot latch.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn config_for(port: u16, data_dir: &Path) -> InstanceConfig {
    InstanceConfig {
        version: "15.4".to_string(),
        port,
        database: "testdb".to_string(),
        username: "u".to_string(),
        password: "p".to_string(),
        data_dir: data_dir.to_path_buf(),
        locale: "C".to_string(),
        charset: "UTF8".to_string(),
    }
}

pub fn connect(port: u16) -> io::Result<TcpStream> {
    TcpStream::connect_timeout(
        &SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_secs(2),
    )
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
