// src/health/mod.rs
mod checker;
mod worker;

pub use checker::HealthMonitor;
pub use worker::{
    refresh_backend, HealthResponse, HttpStatsFetcher, JobQueue, StatsError, StatsFetcher,
    StatsWorkerPool,
};
