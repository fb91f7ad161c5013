//! Pool of listening TCP ports
//!
//! The pool owns an inclusive port range. Allocation binds a listener on a
//! free port and hands out a handle to it; deallocation drops the pool's
//! handle and returns the port. The whole allocate/deallocate critical
//! section, including bind and close, runs under one lock.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::TcpListener;
use std::ops::RangeInclusive;

struct PoolState {
    free: BTreeSet<u16>,
    sockets: HashMap<u16, TcpListener>,
}

/// Thread-safe allocator of listening sockets over a port range
pub struct SocketPool {
    host: String,
    range: RangeInclusive<u16>,
    state: Mutex<PoolState>,
}

impl SocketPool {
    /// Pool over `start..=end` binding on all interfaces
    pub fn new(start: u16, end: u16) -> Result<Self> {
        Self::with_host("0.0.0.0", start, end)
    }

    /// Pool over `start..=end` binding on `host`
    pub fn with_host(host: impl Into<String>, start: u16, end: u16) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "socket pool range is empty ({}..={})",
                start, end
            )));
        }
        let range = start..=end;
        Ok(Self {
            host: host.into(),
            state: Mutex::new(PoolState {
                free: range.clone().collect(),
                sockets: HashMap::new(),
            }),
            range,
        })
    }

    /// Bind a listener on `port`, or on the lowest free port when `None`.
    ///
    /// The returned listener shares its socket with the pool's copy. The
    /// socket closes once both the caller's handle is dropped and the port
    /// is deallocated.
    pub fn allocate(&self, port: Option<u16>) -> Result<TcpListener> {
        self.allocate_port(port).map(|(_, listener)| listener)
    }

    /// Like [`allocate`](Self::allocate), also returning the chosen port
    pub fn allocate_port(&self, port: Option<u16>) -> Result<(u16, TcpListener)> {
        let mut state = self.state.lock();

        let port = match port {
            Some(port) if !self.range.contains(&port) => return Err(Error::PortOutOfRange(port)),
            Some(port) => {
                if !state.free.remove(&port) {
                    return Err(Error::PortUnavailable(port));
                }
                port
            }
            None => state.free.pop_first().ok_or(Error::PoolExhausted)?,
        };

        let bound = TcpListener::bind((self.host.as_str(), port))
            .and_then(|listener| listener.try_clone().map(|handle| (listener, handle)));
        match bound {
            Ok((listener, handle)) => {
                state.sockets.insert(port, listener);
                log::info!("Port {} allocated", port);
                Ok((port, handle))
            }
            Err(e) => {
                state.free.insert(port);
                log::warn!("Failed to bind port {}: {}", port, e);
                Err(Error::Io(e))
            }
        }
    }

    /// Close the pool's socket on `port` and return the port.
    ///
    /// `false` if the port is outside the range or not allocated.
    pub fn deallocate(&self, port: u16) -> bool {
        if !self.range.contains(&port) {
            return false;
        }
        let mut state = self.state.lock();
        match state.sockets.remove(&port) {
            Some(listener) => {
                drop(listener);
                state.free.insert(port);
                log::info!("Port {} deallocated", port);
                true
            }
            None => false,
        }
    }

    /// Deallocate every allocated port
    pub fn collapse(&self) {
        let mut state = self.state.lock();
        let ports: Vec<u16> = state.sockets.keys().copied().collect();
        for port in &ports {
            state.sockets.remove(port);
            state.free.insert(*port);
        }
        if !ports.is_empty() {
            log::info!("Socket pool collapsed ({} ports released)", ports.len());
        }
    }

    /// Free ports, ascending
    pub fn available(&self) -> Vec<u16> {
        self.state.lock().free.iter().copied().collect()
    }

    /// Allocated ports, ascending
    pub fn allocated(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().sockets.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.collapse();
    }
}
