// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatcher: picks the next live backend and hands the request to it
// ────────────────────────────────

use super::pool::ServerPool;
use crate::metrics::{MetricsCollector, Timer};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub struct Proxy {
    pool: Arc<ServerPool>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(pool: Arc<ServerPool>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self { pool, metrics }
    }

    /// Forwards `req` to the next live backend. There is no retry or
    /// reselection: whatever the chosen backend's forwarder returns is final.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let backend = match self.pool.get_next_peer() {
            Some(backend) => backend,
            None => {
                debug!(
                    backends = self.pool.len(),
                    "no live backend for {} {}",
                    req.method(),
                    req.uri().path()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_unavailable();
                }
                return Err(ProxyError::NoHealthyBackends);
            }
        };

        let method = req.method().clone();
        let span = info_span!(
            "forward",
            request_id = %Uuid::new_v4(),
            backend = %backend.id,
            method = %method,
            path = %req.uri().path(),
        );

        let timer = Timer::new();
        let result = backend.forward(req).instrument(span).await;

        if let Some(metrics) = &self.metrics {
            let status = match &result {
                Ok(resp) => resp.status(),
                Err(e) => e.status(),
            };
            metrics.record_request(method.as_str(), status.as_u16(), &backend.id, timer.elapsed());
        }

        result
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) | ProxyError::InvalidUri(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match &err {
            ProxyError::NoHealthyBackends => "Service not available",
            ProxyError::Upstream(_) | ProxyError::InvalidUri(_) => "Bad gateway",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
