// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::{Backend, ServerPool};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RoundRobinBalancer;

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_backend(&self, pool: &ServerPool) -> Option<Arc<Backend>> {
        pool.next_round_robin_peer()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
