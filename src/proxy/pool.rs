//
// src/proxy/pool.rs
//

use super::backend::{format_duration, Backend, BackendStats};
use crate::config::BackendConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed, ordered set of backends plus the round-robin cursor.
///
/// Backends are added during startup only; after that the pool is shared
/// behind an `Arc` and only the backends' own state changes.
#[derive(Debug, Default)]
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    current: AtomicU64,
}

/// Aggregate served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub average_uptime: String,
    pub total_uptime_seconds: u64,
    pub backends: Vec<BackendStats>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[BackendConfig]) -> Self {
        let mut pool = Self::new();
        for config in configs {
            pool.add_backend(Arc::new(Backend::new(config.url.clone())));
            tracing::info!("Configured backend: {}", config.url);
        }
        pool
    }

    pub fn add_backend(&mut self, backend: Arc<Backend>) {
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn next_index(&self) -> usize {
        let next = self.current.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        (next % self.backends.len() as u64) as usize
    }

    /// Round-robin over alive backends.
    ///
    /// When the slot the cursor lands on is dead, the first alive backend after
    /// it is served and the cursor jumps to that position. Concurrent callers
    /// may both observe the same skip and serve the same backend once; that
    /// skew is accepted.
    pub fn next_round_robin_peer(&self) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }

        let len = self.backends.len();
        let next = self.next_index();

        for offset in 0..len {
            let idx = (next + offset) % len;
            let backend = &self.backends[idx];
            if backend.is_alive() {
                if offset != 0 {
                    self.current.store(idx as u64, Ordering::SeqCst);
                }
                return Some(Arc::clone(backend));
            }
        }

        None
    }

    /// Alive backend with the fewest in-flight requests; ties go to the one
    /// added first.
    pub fn least_connections_peer(&self) -> Option<Arc<Backend>> {
        let mut best: Option<(&Arc<Backend>, u64)> = None;

        for backend in &self.backends {
            if !backend.is_alive() {
                continue;
            }
            let count = backend.conn_count();
            match best {
                Some((_, min)) if count >= min => {}
                _ => best = Some((backend, count)),
            }
        }

        best.map(|(backend, _)| Arc::clone(backend))
    }

    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn total_uptime_seconds(&self) -> u64 {
        self.backends
            .iter()
            .filter(|b| b.is_alive())
            .map(|b| b.uptime_seconds())
            .sum()
    }

    /// Mean uptime of alive backends as `HHh:MMm:SSs`, or `"0s"` when none are alive.
    pub fn average_uptime_human(&self) -> String {
        let mut total = 0u64;
        let mut alive = 0u64;
        for backend in &self.backends {
            if backend.is_alive() {
                total += backend.uptime_seconds();
                alive += 1;
            }
        }

        if alive == 0 {
            return "0s".to_string();
        }
        format_duration(total / alive)
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            average_uptime: self.average_uptime_human(),
            total_uptime_seconds: self.total_uptime_seconds(),
            backends: self.stats(),
        }
    }
}
