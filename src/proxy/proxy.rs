// ────────────────────────────────
// src/proxy/proxy.rs
// Per-request routing: pick a peer, hold its connection slot, forward.
// ────────────────────────────────

use super::backend::{Backend, ConnectionGuard};
use super::pool::ServerPool;
use crate::load_balancer::LoadBalancer;
use crate::metrics::{MetricsCollector, Timer};
use async_trait::async_trait;
use futures::StreamExt;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;
use url::Url;

/// Browser noise that never reaches a backend.
pub const FAVICON_PATH: &str = "/favicon.ico";

pub const X_REQUEST_ID: &str = "x-request-id";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Remote address of the inbound connection, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Moves one request to the chosen backend and its response back.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        req: Request<Body>,
        backend: &Backend,
    ) -> Result<Response<Body>, ProxyError>;
}

/// Hyper client based reverse proxy for a single backend per call.
pub struct HttpForwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        req: Request<Body>,
        backend: &Backend,
    ) -> Result<Response<Body>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = target_uri(backend.url(), &parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);
        if let Some(ClientAddr(client)) = parts.extensions.get::<ClientAddr>().copied() {
            append_forwarded_for(&mut parts.headers, client.ip());
        }

        let outbound = Request::from_parts(parts, body);
        match tokio::time::timeout(self.timeout, self.client.request(outbound)).await {
            Ok(Ok(mut response)) => {
                strip_hop_by_hop(response.headers_mut());
                Ok(response)
            }
            Ok(Err(e)) => {
                error!(backend = %backend.address(), "forward failed: {}", e);
                Err(ProxyError::BackendError(e.to_string()))
            }
            Err(_) => {
                warn!(backend = %backend.address(), "forward timed out after {:?}", self.timeout);
                Err(ProxyError::Timeout)
            }
        }
    }
}

/// Rebases the inbound path and query onto the backend's address.
fn target_uri(base: &Url, inbound: &Uri) -> Result<Uri, ProxyError> {
    let host = base
        .host_str()
        .ok_or_else(|| ProxyError::BackendError(format!("backend {} has no host", base)))?;
    let authority = match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let base_path = base.path().trim_end_matches('/');

    format!("{}://{}{}{}", base.scheme(), authority, base_path, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::BackendError(e.to_string()))
}

/// Removes the fixed hop-by-hop set plus any header named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Appends the client to any `X-Forwarded-For` chain already present.
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client)
    };

    match HeaderValue::from_str(&chain) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }
        Err(e) => debug!("dropping unencodable {}: {}", X_FORWARDED_FOR, e),
    }
}

/// Keeps the connection slot until the response body is fully sent or dropped.
fn hold_until_body_ends(response: Response<Body>, slot: ConnectionGuard) -> Response<Body> {
    let (parts, body) = response.into_parts();
    let body = body.map(move |chunk| {
        let _slot = &slot;
        chunk
    });
    Response::from_parts(parts, Body::wrap_stream(body))
}

pub struct Proxy {
    pool: Arc<ServerPool>,
    balancer: Arc<dyn LoadBalancer>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        pool: Arc<ServerPool>,
        balancer: Arc<dyn LoadBalancer>,
        forwarder: Arc<dyn Forwarder>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            pool,
            balancer,
            forwarder,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub async fn handle(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        if req.uri().path() == FAVICON_PATH {
            return Err(ProxyError::NotFound);
        }

        let peer = match self.balancer.select_backend(&self.pool) {
            Some(peer) => peer,
            None => {
                warn!("No alive backend for {} {}", req.method(), req.uri());
                if let Some(metrics) = &self.metrics {
                    metrics.record_unavailable();
                }
                return Err(ProxyError::NoHealthyBackends);
            }
        };

        let request_id = ensure_request_id(req.headers_mut());
        debug!(
            %request_id,
            backend = %peer.address(),
            policy = self.balancer.name(),
            "{} {}",
            req.method(),
            req.uri()
        );

        let timer = Timer::new();
        let slot = self.balancer.tracks_connections().then(|| peer.acquire());
        self.report_connections(&peer);

        // On error the slot is released here; on success it moves into the body.
        let result = self
            .forwarder
            .forward(req, &peer)
            .await
            .map(|response| match slot {
                Some(slot) => hold_until_body_ends(response, slot),
                None => response,
            });
        self.report_connections(&peer);

        if let Some(metrics) = &self.metrics {
            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.status(),
            };
            metrics.record_request(peer.address(), status.as_u16(), timer.elapsed());
        }

        result
    }

    fn report_connections(&self, peer: &Backend) {
        if let Some(metrics) = &self.metrics {
            metrics.update_backend_connections(peer.address(), peer.conn_count());
        }
    }
}

/// Returns the inbound request id, stamping a fresh one when absent.
fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(existing) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return existing.to_string();
    }

    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
    id
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Not found")]
    NotFound,

    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Request timeout")]
    Timeout,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match err {
            ProxyError::NotFound => "Not found",
            ProxyError::NoHealthyBackends => "Service not available",
            ProxyError::BackendError(_) => "Bad gateway",
            ProxyError::Timeout => "Gateway timeout",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
    }
}
