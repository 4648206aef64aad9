// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;

use crate::proxy::{Proxy, ProxyError};

/// Tower service in front of the dispatcher. Dispatch errors never reach
/// hyper; they are rendered as plain-text 503/502 responses.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        Box::pin(async move {
            match proxy.handle(req).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    match &e {
                        // Running out of healthy capacity is an expected state.
                        ProxyError::NoHealthyBackends => tracing::debug!(%e, "request rejected"),
                        _ => tracing::warn!(%e, "forwarding failed"),
                    }
                    Ok(e.into())
                }
            }
        })
    }
}
