// src/proxy/backend.rs
use super::forward::Forward;
use super::ProxyError;
use hyper::{Body, Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// One upstream server: its address, a liveness flag flipped by the health
/// checker, and the capability used to relay requests to it.
pub struct Backend {
    pub id: String,
    url: Url,
    alive: AtomicBool,
    forwarder: Arc<dyn Forward>,
}

impl Backend {
    /// New backends start out alive; the first health-check cycle corrects that.
    pub fn new(url: Url, forwarder: Arc<dyn Forward>) -> Self {
        let id = format!(
            "{}:{}",
            url.host_str().unwrap_or("unknown"),
            url.port_or_known_default().unwrap_or(80)
        );

        Self {
            id,
            url,
            alive: AtomicBool::new(true),
            forwarder,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        self.forwarder.forward(req).await
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("alive", &self.is_alive())
            .finish()
    }
}
