// src/proxy/pool.rs
use super::backend::Backend;
use super::forward::{HttpClient, ReverseProxy};
use crate::config::BackendConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ordered registry of backends plus the shared round-robin cursor.
///
/// Registration takes `&mut self`, so the list can only grow before the pool is
/// wrapped in an `Arc` and handed to the dispatcher and health checker. After
/// that the only mutable state is the cursor and each backend's liveness flag.
#[derive(Debug, Default)]
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    current: AtomicU64,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool with one reverse-proxying backend per config entry,
    /// all sharing `client`.
    pub fn from_configs(configs: &[BackendConfig], client: &HttpClient) -> Self {
        let mut pool = Self::new();

        for config in configs {
            let forwarder = Arc::new(ReverseProxy::new(config.url.clone(), client.clone()));
            pool.add_backend(Arc::new(Backend::new(config.url.clone(), forwarder)));
        }

        pool
    }

    pub fn add_backend(&mut self, backend: Arc<Backend>) {
        tracing::info!("Configured backend: {}", backend.url());
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Claims the next slot of the rotation. Each call bumps the cursor once,
    /// so concurrent callers always receive distinct claims.
    pub fn next_index(&self) -> usize {
        let len = self.backends.len() as u64;
        if len == 0 {
            return 0;
        }

        let claimed = self.current.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        (claimed % len) as usize
    }

    /// Returns the first alive backend at or after the claimed slot, scanning
    /// at most one full pass. When a dead slot had to be skipped the cursor is
    /// moved onto the backend actually picked so the next caller starts after it.
    pub fn get_next_peer(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let next = self.next_index();
        for i in next..next + len {
            let idx = i % len;
            let backend = &self.backends[idx];

            if backend.is_alive() {
                if i != next {
                    // Races with concurrent next_index() calls; last store wins.
                    self.current.store(idx as u64, Ordering::SeqCst);
                }
                return Some(Arc::clone(backend));
            }
        }

        None
    }
}
