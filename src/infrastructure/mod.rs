//! Infrastructure Layer
//!
//! Resilience primitives, monitors and cross-cutting services.

pub mod cache;
pub mod circuit_breaker;
pub mod connection_monitor;
pub mod health_monitor;
pub mod logger;
pub mod retry;
pub mod shutdown;

pub use cache::{Cache, CacheConfig, CacheManager, CacheStats, CacheType};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus,
};
pub use connection_monitor::{
    ConnectionLease, ConnectionMonitor, ConnectionMonitorConfig, MonitorCounters, PoolMetrics,
    PoolStatus, QueryStats, Verbosity,
};
pub use health_monitor::{
    CheckOutcome, DatabaseCheck, HealthCheck, HealthIssue, HealthMonitor, HealthMonitorConfig,
    HealthRecord, HealthSnapshot, HealthState, OverallStatus,
};
pub use logger::{
    init_logging, LogCategory, Logger, OperationTimer, PerformanceTracker, TimingReport,
    TimingSummary,
};
pub use retry::{RetryConfig, RetryHandler, RetryStats};
pub use shutdown::{
    CleanupOutcome, ExitFn, GracefulShutdown, ShutdownConfig, ShutdownReport, PANIC_REASON,
};
