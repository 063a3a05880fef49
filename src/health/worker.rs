// src/health/worker.rs
use crate::metrics::MetricsCollector;
use crate::proxy::Backend;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Largest stats body a worker will buffer.
pub const MAX_STATS_BODY_BYTES: usize = 64 * 1024;

/// Body returned by a backend's stats endpoint.
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub memory_usage: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("malformed body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("body exceeds {0} bytes")]
    TooLarge(usize),
}

/// Reads the current memory figure from one backend.
#[async_trait]
pub trait StatsFetcher: Send + Sync {
    async fn fetch(&self, backend: &Backend) -> Result<u64, StatsError>;
}

pub struct HttpStatsFetcher {
    client: Client,
    path: String,
}

impl HttpStatsFetcher {
    pub fn new(timeout: Duration, path: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }
}

#[async_trait]
impl StatsFetcher for HttpStatsFetcher {
    async fn fetch(&self, backend: &Backend) -> Result<u64, StatsError> {
        let url = format!("{}{}", backend.address(), self.path);
        let mut response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StatsError::Status(status));
        }

        if response
            .content_length()
            .map_or(false, |len| len > MAX_STATS_BODY_BYTES as u64)
        {
            return Err(StatsError::TooLarge(MAX_STATS_BODY_BYTES));
        }

        // Content-Length may be absent, so the cap is enforced while reading too.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_STATS_BODY_BYTES {
                return Err(StatsError::TooLarge(MAX_STATS_BODY_BYTES));
            }
            body.extend_from_slice(&chunk);
        }

        let health: HealthResponse = serde_json::from_slice(&body)?;
        Ok(health.memory_usage)
    }
}

/// Producer side of the bounded stats job queue. Enqueueing never waits.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Arc<Backend>>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Arc<Backend>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` when the job was dropped.
    pub fn try_enqueue(&self, backend: Arc<Backend>) -> bool {
        match self.tx.try_send(backend) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(backend)) => {
                debug!(backend = %backend.address(), "stats queue closed, job discarded");
                false
            }
        }
    }
}

/// Fixed set of tasks draining the stats job queue.
pub struct StatsWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl StatsWorkerPool {
    pub fn spawn(
        workers: usize,
        jobs: mpsc::Receiver<Arc<Backend>>,
        fetcher: Arc<dyn StatsFetcher>,
        shutdown: watch::Receiver<bool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let jobs = Arc::new(Mutex::new(jobs));
        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    jobs.clone(),
                    fetcher.clone(),
                    shutdown.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for (id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, "stats worker terminated abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Arc<Backend>>>>,
    fetcher: Arc<dyn StatsFetcher>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<Arc<MetricsCollector>>,
) {
    debug!(worker = id, "stats worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Cancellation wins over a ready job.
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = next_job(&jobs) => job,
        };

        match next {
            Some(backend) => refresh_backend(fetcher.as_ref(), &backend, metrics.as_deref()).await,
            None => break,
        }
    }

    debug!(worker = id, "stats worker stopped");
}

async fn next_job(jobs: &Mutex<mpsc::Receiver<Arc<Backend>>>) -> Option<Arc<Backend>> {
    jobs.lock().await.recv().await
}

/// Fetches and stores one backend's memory figure. On failure the previous
/// figure is kept.
pub async fn refresh_backend(
    fetcher: &dyn StatsFetcher,
    backend: &Backend,
    metrics: Option<&MetricsCollector>,
) {
    match fetcher.fetch(backend).await {
        Ok(bytes) => {
            backend.set_memory_usage(bytes);
            if let Some(metrics) = metrics {
                metrics.update_backend_memory(backend.address(), bytes);
            }
            debug!(backend = %backend.address(), bytes, "stats refreshed");
        }
        Err(e) => {
            warn!("Error fetching stats from {}: {}", backend.address(), e);
            if let Some(metrics) = metrics {
                metrics.record_stats_refresh_failure(backend.address());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl StatsFetcher for CountingFetcher {
        async fn fetch(&self, _backend: &Backend) -> Result<u64, StatsError> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(4096)
        }
    }

    fn counting(delay: Duration) -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn backend_at(url: &str) -> Arc<Backend> {
        Arc::new(Backend::new(Url::parse(url).unwrap()))
    }

    fn fetcher() -> HttpStatsFetcher {
        HttpStatsFetcher::new(Duration::from_secs(5), "/health").unwrap()
    }

    #[tokio::test]
    async fn test_refresh_updates_memory() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"memory_usage": 5000}"#)
            .create_async()
            .await;

        let backend = backend_at(&server.url());
        refresh_backend(&fetcher(), &backend, None).await;
        assert_eq!(backend.memory_usage(), 5000);
    }

    #[tokio::test]
    async fn test_refresh_keeps_memory_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;

        let backend = backend_at(&server.url());
        backend.set_memory_usage(100);

        let err = fetcher().fetch(&backend).await.unwrap_err();
        assert!(matches!(err, StatsError::Status(s) if s == StatusCode::INTERNAL_SERVER_ERROR));

        refresh_backend(&fetcher(), &backend, None).await;
        assert_eq!(backend.memory_usage(), 100);
    }

    #[tokio::test]
    async fn test_refresh_keeps_memory_on_bad_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("{invalid-json}")
            .create_async()
            .await;

        let backend = backend_at(&server.url());
        backend.set_memory_usage(100);

        let err = fetcher().fetch(&backend).await.unwrap_err();
        assert!(matches!(err, StatsError::Decode(_)));

        refresh_backend(&fetcher(), &backend, None).await;
        assert_eq!(backend.memory_usage(), 100);
    }

    #[tokio::test]
    async fn test_refresh_rejects_oversized_body() {
        let mut server = mockito::Server::new_async().await;
        let padding = " ".repeat(MAX_STATS_BODY_BYTES);
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(format!(r#"{{"memory_usage": 7{}}}"#, padding))
            .create_async()
            .await;

        let backend = backend_at(&server.url());
        backend.set_memory_usage(100);

        let err = fetcher().fetch(&backend).await.unwrap_err();
        assert!(matches!(err, StatsError::TooLarge(MAX_STATS_BODY_BYTES)));

        refresh_backend(&fetcher(), &backend, None).await;
        assert_eq!(backend.memory_usage(), 100);
    }

    #[tokio::test]
    async fn test_refresh_survives_network_error() {
        let backend = backend_at("http://127.0.0.1:1");
        backend.set_memory_usage(100);

        let err = fetcher().fetch(&backend).await.unwrap_err();
        assert!(matches!(err, StatsError::Transport(_)));

        refresh_backend(&fetcher(), &backend, None).await;
        assert_eq!(backend.memory_usage(), 100);
    }

    #[tokio::test]
    async fn test_queue_drops_when_full() {
        let (queue, _rx) = JobQueue::bounded(2);
        let backend = backend_at("http://127.0.0.1:8081");

        assert!(queue.try_enqueue(backend.clone()));
        assert!(queue.try_enqueue(backend.clone()));
        assert!(!queue.try_enqueue(backend));
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let (queue, rx) = JobQueue::bounded(4);
        let (_tx, shutdown) = watch::channel(false);
        let fetcher = counting(Duration::from_millis(1));

        let pool = StatsWorkerPool::spawn(3, rx, fetcher.clone(), shutdown, None);
        assert_eq!(pool.len(), 3);

        let backend = backend_at("http://127.0.0.1:8081");
        for _ in 0..4 {
            assert!(queue.try_enqueue(backend.clone()));
        }

        // Closing the queue lets workers finish once it is drained.
        drop(queue);
        tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(backend.memory_usage(), 4096);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown_with_pending_jobs() {
        let (queue, rx) = JobQueue::bounded(16);
        let (tx, shutdown) = watch::channel(false);
        let fetcher = counting(Duration::from_millis(50));

        let pool = StatsWorkerPool::spawn(2, rx, fetcher.clone(), shutdown, None);

        let backend = backend_at("http://127.0.0.1:8081");
        for _ in 0..16 {
            queue.try_enqueue(backend.clone());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .unwrap();

        // Only the jobs already in progress completed.
        assert!(fetcher.calls.load(Ordering::SeqCst) <= 2);
    }
}
