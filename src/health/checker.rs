// src/health/checker.rs
use super::HealthStatus;
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, ServerPool};
use anyhow::Result;
use futures::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<ServerPool>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub url: Url,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<ServerPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout()).build()?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Runs one cycle per interval tick until `shutdown` is called. The first
    /// tick fires immediately.
    pub async fn start(self: Arc<Self>) {
        let mut interval = interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker for {} backends with interval {:?}, timeout {:?}",
            self.pool.len(),
            self.config.interval(),
            self.config.timeout()
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Checks every backend concurrently and records the outcome on each.
    pub async fn run_once(&self) -> Vec<HealthCheckResult> {
        let checks = self
            .pool
            .backends()
            .iter()
            .map(|backend| self.check_backend(backend));
        let results = join_all(checks).await;

        let healthy_count = self.pool.healthy_count();
        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(healthy_count, results.len());
        }

        debug!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count,
            results.len().saturating_sub(healthy_count)
        );

        results
    }

    async fn check_backend(&self, backend: &Arc<Backend>) -> HealthCheckResult {
        let start = Instant::now();

        let outcome = self.check_url(health_url(backend.url(), &self.config.path)).await;

        let response_time_ms = start.elapsed().as_millis() as u64;
        let status = HealthStatus::from(outcome.is_ok());
        backend.set_alive(status.is_up());

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(&backend.id, status.is_up());
        }

        match &outcome {
            Ok(()) => info!(response_time_ms, "{} [{}]", backend.url(), status),
            Err(error) => warn!(%error, "{} [{}]", backend.url(), status),
        }

        HealthCheckResult {
            backend_id: backend.id.clone(),
            url: backend.url().clone(),
            status,
            response_time_ms,
            error: outcome.err(),
        }
    }

    async fn check_url(&self, url: Url) -> Result<(), String> {
        match timeout(self.config.timeout(), self.client.get(url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("HTTP {}", response.status())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("Request timeout".to_string()),
        }
    }
}

/// `path` (plus optional query) appended to the backend's base path.
fn health_url(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    if path.is_empty() {
        return url;
    }

    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    url.set_path(&format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    ));
    url.set_query(query);
    url
}
