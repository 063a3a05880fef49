// src/load_balancer/least_connections.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::{Backend, ServerPool};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select_backend(&self, pool: &ServerPool) -> Option<Arc<Backend>> {
        pool.least_connections_peer()
    }

    fn tracks_connections(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
