// src/config/models.rs
use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,

    /// Upper bound on one proxied call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: Url,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    RoundRobin,
    #[default]
    LeastConnections,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stats_timeout_ms: u64,
    pub stats_path: String,
    pub workers: usize,
    /// Stats job queue size; the backend count when unset.
    pub queue_capacity: Option<usize>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20_000,
            probe_timeout_ms: 2_000,
            stats_timeout_ms: 5_000,
            stats_path: "/health".to_string(),
            workers: 3,
            queue_capacity: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    pub fn queue_capacity_for(&self, backend_count: usize) -> usize {
        self.queue_capacity.unwrap_or(backend_count).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

fn default_listen_port() -> u16 {
    3030
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one backend must be configured");
        }

        for backend in &self.backends {
            if backend.url.scheme() != "http" {
                bail!(
                    "backend {} uses unsupported scheme '{}'",
                    backend.url,
                    backend.url.scheme()
                );
            }
            if backend.url.host_str().is_none() {
                bail!("backend {} has no host", backend.url);
            }
        }

        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be greater than zero");
        }

        let hc = &self.health_check;
        if hc.interval_ms == 0 {
            bail!("health_check.interval_ms must be greater than zero");
        }
        if hc.probe_timeout_ms == 0 || hc.stats_timeout_ms == 0 {
            bail!("health_check timeouts must be greater than zero");
        }
        if hc.workers == 0 {
            bail!("health_check.workers must be greater than zero");
        }
        if hc.queue_capacity == Some(0) {
            bail!("health_check.queue_capacity must be greater than zero");
        }
        if !hc.stats_path.starts_with('/') {
            bail!("health_check.stats_path must start with '/'");
        }

        Ok(())
    }
}
