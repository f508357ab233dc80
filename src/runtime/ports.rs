// Synchronized port allocation for app dev servers
// The configured range is a process-wide shared resource; leases keep
// two apps from ever binding the same port

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// No free port remained in the configured range
#[derive(Debug, Error)]
#[error("no free port in range {start}-{end}")]
pub struct PortExhausted {
    pub start: u16,
    pub end: u16,
}

/// Allocates ports from an inclusive range
///
/// A lease releases its port when dropped unless it was committed into
/// a running process handle, so a failed spawn can never leak a port.
#[derive(Debug)]
pub struct PortAllocator {
    range: (u16, u16),
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Arc<Self> {
        Arc::new(Self {
            range,
            leased: Mutex::new(HashSet::new()),
        })
    }

    /// Lease a free port, preferring the app's previously bound port
    ///
    /// Falls back to a monotonic scan over the range, probing each
    /// candidate with a local bind.
    pub fn acquire(self: &Arc<Self>, preferred: Option<u16>) -> Result<PortLease, PortExhausted> {
        let (start, end) = self.range;
        let mut leased = self.leased.lock().unwrap();

        if let Some(port) = preferred {
            if port >= start && port <= end && !leased.contains(&port) && probe_free(port) {
                leased.insert(port);
                return Ok(PortLease::new(Arc::clone(self), port));
            }
        }

        for port in start..=end {
            if leased.contains(&port) {
                continue;
            }
            if probe_free(port) {
                leased.insert(port);
                return Ok(PortLease::new(Arc::clone(self), port));
            }
        }

        Err(PortExhausted { start, end })
    }

    /// Return a port to the pool; idempotent
    pub fn release(&self, port: u16) {
        self.leased.lock().unwrap().remove(&port);
    }

    /// Number of currently leased ports
    pub fn leased_count(&self) -> usize {
        self.leased.lock().unwrap().len()
    }
}

/// Check whether the port is bindable on the loopback interface
fn probe_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// RAII lease on a port
#[derive(Debug)]
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
    armed: bool,
}

impl PortLease {
    fn new(allocator: Arc<PortAllocator>, port: u16) -> Self {
        Self {
            allocator,
            port,
            armed: true,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the port leased past this guard's lifetime
    ///
    /// Called once the process holding the port has actually spawned;
    /// the launcher releases it on stop or exit.
    pub fn commit(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(self.port);
        }
    }
}
