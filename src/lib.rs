//! iREVA Server Library
//!
//! Resilience and bootstrap layer of the iREVA server: staged startup,
//! circuit breakers, retry with backoff, pool monitoring, a tiered cache,
//! health aggregation and graceful shutdown.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::inbound::{ApiRoutes, AppRouter};
pub use adapters::outbound::{SqliteDatabase, SqlitePool, SqlitePoolConfig};
pub use application::{BootHandles, BootPhase, Bootstrapper, CoreServices};
pub use config::{load_config, Config};
pub use domain::errors::{InitializationError, OperationError, ResilienceError, StorageError};
pub use domain::ports::{Database, PoolProbe, QueryObserver, RouteRegistrar, SessionStore, Storage};
pub use infrastructure::{
    CacheManager, CircuitBreaker, CircuitBreakerRegistry, ConnectionMonitor, GracefulShutdown,
    HealthMonitor, RetryHandler,
};
