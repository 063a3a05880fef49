// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub unavailable_total: IntCounter,

    // Backend metrics
    pub backend_connections_active: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,
    pub backend_memory_bytes: IntGaugeVec,

    // Stats refresh metrics
    pub stats_jobs_dropped_total: IntCounterVec,
    pub stats_refresh_failures_total: IntCounterVec,

    // Pool metrics
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of proxied requests"),
            &["backend", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "Proxied request duration in seconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let unavailable_total = IntCounter::new(
            "lb_unavailable_total",
            "Requests rejected because no backend was alive",
        )?;
        registry.register(Box::new(unavailable_total.clone()))?;

        let backend_connections_active = IntGaugeVec::new(
            Opts::new(
                "lb_backend_connections_active",
                "Active backend connections",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_connections_active.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=alive, 0=dead)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let backend_memory_bytes = IntGaugeVec::new(
            Opts::new(
                "lb_backend_memory_bytes",
                "Last memory usage reported by the backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_memory_bytes.clone()))?;

        let stats_jobs_dropped_total = IntCounterVec::new(
            Opts::new(
                "lb_stats_jobs_dropped_total",
                "Stats refresh jobs skipped because the queue was full",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(stats_jobs_dropped_total.clone()))?;

        let stats_refresh_failures_total = IntCounterVec::new(
            Opts::new(
                "lb_stats_refresh_failures_total",
                "Failed stats refresh attempts",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(stats_refresh_failures_total.clone()))?;

        let healthy_backends =
            IntGauge::new("lb_healthy_backends", "Number of alive backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends =
            IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            unavailable_total,
            backend_connections_active,
            backend_health_status,
            backend_memory_bytes,
            stats_jobs_dropped_total,
            stats_refresh_failures_total,
            healthy_backends,
            total_backends,
        })
    }

    pub fn record_request(&self, backend: &str, status_code: u16, duration: std::time::Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[backend, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_unavailable(&self) {
        self.unavailable_total.inc();
    }

    pub fn update_backend_connections(&self, backend: &str, count: u64) {
        self.backend_connections_active
            .with_label_values(&[backend])
            .set(count as i64);
    }

    pub fn update_backend_health(&self, backend: &str, alive: bool) {
        let value = if alive { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_memory(&self, backend: &str, bytes: u64) {
        self.backend_memory_bytes
            .with_label_values(&[backend])
            .set(bytes as i64);
    }

    pub fn record_stats_job_dropped(&self, backend: &str) {
        self.stats_jobs_dropped_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn record_stats_refresh_failure(&self, backend: &str) {
        self.stats_refresh_failures_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
