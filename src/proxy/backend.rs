// src/proxy/backend.rs
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug)]
struct BackendState {
    alive: bool,
    /// Start of the current alive streak.
    start_time: Instant,
    /// Last figure reported by the backend's stats endpoint.
    memory_usage: u64,
}

/// One upstream server. Liveness, uptime origin and memory usage sit behind a
/// per-backend read/write lock; the connection counter is lock-free.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    address: String,
    state: RwLock<BackendState>,
    conn_count: AtomicU64,
}

impl Backend {
    /// New backends start out alive with their uptime origin set to now.
    pub fn new(url: Url) -> Self {
        let address = url.as_str().trim_end_matches('/').to_string();

        Self {
            url,
            address,
            state: RwLock::new(BackendState {
                alive: true,
                start_time: Instant::now(),
                memory_usage: 0,
            }),
            conn_count: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Scheme and authority without a trailing slash, e.g. `http://10.0.0.1:8080`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_alive(&self, alive: bool) {
        let mut state = self.state.write();
        if alive && !state.alive {
            state.start_time = Instant::now();
        }
        state.alive = alive;
    }

    pub fn is_alive(&self) -> bool {
        self.state.read().alive
    }

    /// Seconds since the backend last came up, zero while it is down.
    pub fn uptime_seconds(&self) -> u64 {
        let state = self.state.read();
        if !state.alive {
            return 0;
        }
        state.start_time.elapsed().as_secs()
    }

    pub fn uptime_human(&self) -> String {
        format_duration(self.uptime_seconds())
    }

    pub fn inc_conn(&self) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the connection counter, never going below zero.
    pub fn dec_conn(&self) {
        let mut current = self.conn_count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return;
            }
            match self.conn_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn conn_count(&self) -> u64 {
        self.conn_count.load(Ordering::SeqCst)
    }

    /// Counts one in-flight request until the returned guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.inc_conn();
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    pub fn set_memory_usage(&self, bytes: u64) {
        self.state.write().memory_usage = bytes;
    }

    pub fn memory_usage(&self) -> u64 {
        self.state.read().memory_usage
    }

    pub fn memory_usage_human(&self) -> String {
        format_bytes(self.memory_usage())
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: u64) {
        self.state.write().start_time = Instant::now() - std::time::Duration::from_secs(secs);
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            url: self.address.clone(),
            alive: self.is_alive(),
            uptime: self.uptime_human(),
            memory_usage: self.memory_usage_human(),
            conn_count: self.conn_count(),
        }
    }
}

/// Releases the connection slot taken by [`Backend::acquire`], including on
/// early return and unwinding.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_conn();
    }
}

/// Point-in-time view of one backend for the stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub url: String,
    pub alive: bool,
    pub uptime: String,
    pub memory_usage: String,
    pub conn_count: u64,
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    }
}

pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}h:{:02}m:{:02}s", hours, minutes, secs)
}
