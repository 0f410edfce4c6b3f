//! Core Service Slots
//!
//! Components initialized by the core and background boot phases. A slot
//! stays empty when its initializer failed or has not run yet, so every
//! reader checks for presence before use.

use crate::infrastructure::{CacheManager, CircuitBreakerRegistry, ConnectionMonitor, RetryHandler};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Retry handler used for the database connect step.
pub const DATABASE_RETRY: &str = "database";

/// Retry handler used for idempotent storage reads.
pub const STORAGE_RETRY: &str = "storage";

#[derive(Default)]
pub struct CoreServices {
    cache: RwLock<Option<Arc<CacheManager>>>,
    connection_monitor: RwLock<Option<Arc<ConnectionMonitor>>>,
    breakers: RwLock<Option<Arc<CircuitBreakerRegistry>>>,
    retry_handlers: DashMap<String, RetryHandler>,
}

impl CoreServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> Option<Arc<CacheManager>> {
        self.cache.read().clone()
    }

    pub fn set_cache(&self, cache: Arc<CacheManager>) {
        *self.cache.write() = Some(cache);
    }

    pub fn connection_monitor(&self) -> Option<Arc<ConnectionMonitor>> {
        self.connection_monitor.read().clone()
    }

    /// Install the monitor unless one is already present. Returns whether it was installed.
    pub fn set_connection_monitor(&self, monitor: Arc<ConnectionMonitor>) -> bool {
        let mut slot = self.connection_monitor.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(monitor);
        true
    }

    pub fn breakers(&self) -> Option<Arc<CircuitBreakerRegistry>> {
        self.breakers.read().clone()
    }

    pub fn set_breakers(&self, registry: Arc<CircuitBreakerRegistry>) {
        *self.breakers.write() = Some(registry);
    }

    pub fn retry_handler(&self, service: &str) -> Option<RetryHandler> {
        self.retry_handlers.get(service).map(|h| h.clone())
    }

    pub fn add_retry_handler(&self, handler: RetryHandler) {
        self.retry_handlers
            .insert(handler.service().to_string(), handler);
    }

    /// Retry handlers sorted by service name.
    pub fn retry_handlers(&self) -> Vec<RetryHandler> {
        let mut handlers: Vec<RetryHandler> =
            self.retry_handlers.iter().map(|h| h.clone()).collect();
        handlers.sort_by(|a, b| a.service().cmp(b.service()));
        handlers
    }
}
