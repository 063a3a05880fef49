// tests/load_balancer_tests.rs
use async_trait::async_trait;
use hyper::{Body, Request, StatusCode};
use pool_balancer::config::{HealthCheckConfig, LoadBalancerAlgorithm};
use pool_balancer::health::{HealthMonitor, JobQueue, StatsError, StatsFetcher};
use pool_balancer::load_balancer::create_load_balancer;
use pool_balancer::proxy::{Backend, HttpForwarder, Proxy, ServerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn pool_with(urls: &[String]) -> Arc<ServerPool> {
    let mut pool = ServerPool::new();
    for url in urls {
        pool.add_backend(Arc::new(Backend::new(Url::parse(url).unwrap())));
    }
    Arc::new(pool)
}

fn health_config(interval_ms: u64) -> HealthCheckConfig {
    HealthCheckConfig {
        interval_ms,
        probe_timeout_ms: 500,
        stats_timeout_ms: 500,
        ..HealthCheckConfig::default()
    }
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_failing_backend_excluded_until_it_recovers() {
    let mut healthy_a = mockito::Server::new_async().await;
    let mut healthy_b = mockito::Server::new_async().await;
    let mut flaky = mockito::Server::new_async().await;

    let _a = healthy_a.mock("GET", "/").with_status(200).create_async().await;
    let _b = healthy_b.mock("GET", "/").with_status(200).create_async().await;
    let broken = flaky.mock("GET", "/").with_status(500).create_async().await;

    let pool = pool_with(&[healthy_a.url(), flaky.url(), healthy_b.url()]);
    let monitor = HealthMonitor::new(health_config(1_000), pool.clone(), None).unwrap();
    let (queue, _jobs) = JobQueue::bounded(pool.len());

    monitor.check_all_backends(&queue).await;

    let flaky_addr = pool.backends()[1].address().to_string();
    assert!(!pool.backends()[1].is_alive());

    for _ in 0..30 {
        let peer = pool.next_round_robin_peer().unwrap();
        assert_ne!(peer.address(), flaky_addr);
    }

    // Even with the survivors loaded, least-connections never picks the dead one.
    pool.backends()[0].inc_conn();
    pool.backends()[2].inc_conn();
    for _ in 0..10 {
        let peer = pool.least_connections_peer().unwrap();
        assert_ne!(peer.address(), flaky_addr);
    }

    broken.remove_async().await;
    let _fixed = flaky.mock("GET", "/").with_status(200).create_async().await;

    monitor.check_all_backends(&queue).await;
    assert!(pool.backends()[1].is_alive());

    let peer = pool.least_connections_peer().unwrap();
    assert_eq!(peer.address(), flaky_addr);
}

struct SlowFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl StatsFetcher for SlowFetcher {
    async fn fetch(&self, _backend: &Backend) -> Result<u64, StatsError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(1024)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_stats_jobs_do_not_stall_liveness_loop() {
    let mut server = mockito::Server::new_async().await;
    let _root = server.mock("GET", "/").with_status(200).create_async().await;

    let urls: Vec<String> = (0..5).map(|_| server.url()).collect();
    let pool = pool_with(&urls);

    let config = HealthCheckConfig {
        workers: 3,
        queue_capacity: Some(5),
        ..health_config(30)
    };
    let fetcher = Arc::new(SlowFetcher {
        calls: AtomicUsize::new(0),
    });
    let monitor = Arc::new(
        HealthMonitor::new(config, pool.clone(), None)
            .unwrap()
            .with_fetcher(fetcher.clone()),
    );

    let handle = tokio::spawn(monitor.clone().start());
    tokio::time::sleep(Duration::from_millis(400)).await;
    monitor.shutdown();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor did not shut down")
        .unwrap();

    // Ticks kept coming while the workers were saturated.
    assert!(monitor.cycles() >= 4, "only {} cycles", monitor.cycles());
    assert!(monitor.dropped_jobs() > 0);
    assert!(fetcher.calls.load(Ordering::SeqCst) > 0);
    assert!(pool.backends().iter().any(|b| b.memory_usage() == 1024));
}

#[tokio::test]
async fn test_round_robin_spreads_requests_over_backends() {
    let mut first = mockito::Server::new_async().await;
    let mut second = mockito::Server::new_async().await;
    let first_mock = first
        .mock("GET", "/work")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    let second_mock = second
        .mock("GET", "/work")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let pool = pool_with(&[first.url(), second.url()]);
    let proxy = Proxy::new(
        pool,
        create_load_balancer(LoadBalancerAlgorithm::RoundRobin),
        Arc::new(HttpForwarder::new(Duration::from_secs(5))),
        None,
    );

    for _ in 0..4 {
        let response = proxy.handle(get("/work")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    first_mock.assert_async().await;
    second_mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_least_connections_requests_settle_at_zero() {
    let mut first = mockito::Server::new_async().await;
    let mut second = mockito::Server::new_async().await;
    let _first = first.mock("GET", "/").with_status(200).create_async().await;
    let _second = second.mock("GET", "/").with_status(200).create_async().await;

    let pool = pool_with(&[first.url(), second.url()]);
    let proxy = Arc::new(Proxy::new(
        pool.clone(),
        create_load_balancer(LoadBalancerAlgorithm::LeastConnections),
        Arc::new(HttpForwarder::new(Duration::from_secs(5))),
        None,
    ));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.handle(get("/")).await })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert!(pool.backends().iter().all(|b| b.conn_count() == 0));
}

#[tokio::test]
async fn test_all_backends_down_returns_unavailable() {
    let pool = pool_with(&[
        "http://127.0.0.1:1".to_string(),
        "http://127.0.0.1:2".to_string(),
    ]);
    let monitor = HealthMonitor::new(health_config(1_000), pool.clone(), None).unwrap();
    let (queue, _jobs) = JobQueue::bounded(pool.len());

    monitor.check_all_backends(&queue).await;
    assert_eq!(pool.alive_count(), 0);
    assert_eq!(pool.average_uptime_human(), "0s");

    let proxy = Proxy::new(
        pool,
        create_load_balancer(LoadBalancerAlgorithm::RoundRobin),
        Arc::new(HttpForwarder::new(Duration::from_secs(1))),
        None,
    );
    let err = proxy.handle(get("/")).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
}
