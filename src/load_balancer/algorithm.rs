// src/load_balancer/algorithm.rs
use crate::proxy::{Backend, ServerPool};
use std::sync::Arc;

/// Peer selection policy. Selection never blocks or suspends.
pub trait LoadBalancer: Send + Sync {
    fn select_backend(&self, pool: &ServerPool) -> Option<Arc<Backend>>;

    /// Whether the router must count in-flight requests on the chosen peer.
    fn tracks_connections(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}
