// src/health/checker.rs
use super::worker::{HttpStatsFetcher, JobQueue, StatsFetcher, StatsWorkerPool};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, ServerPool};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Background liveness probing plus stats refresh dispatch.
///
/// Every tick probes all backends, flips liveness on change and offers one
/// stats job per alive backend to a bounded queue. A full queue drops the job
/// for that cycle instead of delaying the next tick.
pub struct HealthMonitor {
    config: HealthCheckConfig,
    pool: Arc<ServerPool>,
    client: Client,
    fetcher: Arc<dyn StatsFetcher>,
    metrics: Option<Arc<MetricsCollector>>,
    cycles: AtomicU64,
    dropped_jobs: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<ServerPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .context("Failed to create probe client")?;

        let fetcher = HttpStatsFetcher::new(config.stats_timeout(), config.stats_path.clone())
            .context("Failed to create stats client")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            client,
            fetcher: Arc::new(fetcher),
            metrics,
            cycles: AtomicU64::new(0),
            dropped_jobs: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Replaces the HTTP stats fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn StatsFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Completed liveness cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Stats jobs skipped because the queue was full.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped_jobs.load(Ordering::Relaxed)
    }

    /// Runs until [`HealthMonitor::shutdown`] is called, then waits for the
    /// stats workers to exit.
    pub async fn start(self: Arc<Self>) {
        let capacity = self.config.queue_capacity_for(self.pool.len());
        let (queue, jobs) = JobQueue::bounded(capacity);
        let workers = StatsWorkerPool::spawn(
            self.config.workers,
            jobs,
            self.fetcher.clone(),
            self.shutdown_rx.clone(),
            self.metrics.clone(),
        );

        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            interval = ?period,
            workers = workers.len(),
            queue_capacity = capacity,
            "Starting health monitor"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_all_backends(&queue).await;
                }
            }
        }

        drop(queue);
        workers.join().await;
        info!("Health monitor shutting down");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One liveness cycle over every backend.
    pub async fn check_all_backends(&self, queue: &JobQueue) {
        let backends = self.pool.backends();
        let results =
            futures::future::join_all(backends.iter().map(|backend| self.probe(backend))).await;

        for (backend, alive) in backends.iter().zip(results) {
            if backend.is_alive() != alive {
                if alive {
                    info!("Status change: {} [up]", backend.address());
                } else {
                    warn!("Status change: {} [down]", backend.address());
                }
                backend.set_alive(alive);
            }

            if let Some(metrics) = &self.metrics {
                metrics.update_backend_health(backend.address(), alive);
            }

            if alive && !queue.try_enqueue(Arc::clone(backend)) {
                self.dropped_jobs.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Worker pool full, skipping stats update for {}",
                    backend.address()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_stats_job_dropped(backend.address());
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(self.pool.alive_count(), self.pool.len());
        }
    }

    /// GET on the backend's base address; any 2xx or 3xx counts as alive.
    pub async fn probe(&self, backend: &Backend) -> bool {
        match self.client.get(backend.url().clone()).send().await {
            Ok(response) => {
                let status = response.status();
                let alive = (200..400).contains(&status.as_u16());
                if !alive {
                    debug!(backend = %backend.address(), %status, "probe returned error status");
                }
                alive
            }
            Err(e) => {
                debug!(backend = %backend.address(), "Site unreachable: {}", e);
                false
            }
        }
    }
}
