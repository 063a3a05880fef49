// src/server/handler.rs
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::sync::Arc;
use tower::Service;

use crate::proxy::{Proxy, ServerPool};

/// Path answered by the balancer itself instead of a backend.
pub const STATS_PATH: &str = "/stats";

#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }

    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        if req.method() == Method::GET && req.uri().path() == STATS_PATH {
            return stats_response(self.proxy.pool());
        }

        match self.proxy.handle(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%e, "request not proxied");
                Response::from(e)
            }
        }
    }
}

fn stats_response(pool: &ServerPool) -> Response<Body> {
    match serde_json::to_vec(&pool.pool_stats()) {
        Ok(json) => {
            let mut response = Response::new(Body::from(json));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(%e, "failed to encode stats");
            let mut response = Response::new(Body::from(e.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.route(req).await) })
    }
}
