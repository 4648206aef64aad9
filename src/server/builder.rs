// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::ClientAddr;
use crate::server::listener::{bind_tcp, is_connection_error, Listener};
use anyhow::{Context, Result};
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

/// Pause after an accept error that is not tied to a single connection.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);

/// Builder pattern so `main.rs` can inject its dispatcher (or any handler).
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    /// Inject your request handler (usually wraps `proxy::Proxy`).
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bind `addr` and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_tcp(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Accept on an already-bound listener. Each connection gets its own task
    /// and the peer address is attached to every request as [`ClientAddr`].
    /// In-flight connections are left to finish after `signal` resolves.
    ///
    /// Accept failures never end the loop: a connection that died in the
    /// backlog is skipped, anything else (e.g. out of file descriptors) is
    /// logged and retried after [`ACCEPT_BACKOFF`].
    pub async fn serve_on<L, F>(self, listener: L, signal: F) -> Result<()>
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;

        tracing::info!("HTTP server listening on {}", listener.local_addr()?);
        tokio::pin!(signal);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut signal => break,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(err) if is_connection_error(&err) => {
                    tracing::debug!(%err, "accepted connection already closed");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%err, "accept failed, retrying in {:?}", ACCEPT_BACKOFF);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        _ = &mut signal => break,
                    }
                    continue;
                }
            };

            let svc = ServiceBuilder::new()
                .map_request(move |mut req: Request<Body>| {
                    req.extensions_mut().insert(ClientAddr(peer));
                    req
                })
                .service(handler.clone());

            tokio::spawn(async move {
                let http = Http::new();
                if let Err(err) = http.serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }

        tracing::info!("HTTP server no longer accepting connections");
        Ok(())
    }
}
