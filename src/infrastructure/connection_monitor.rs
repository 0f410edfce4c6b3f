//! Connection Pool Monitor
//!
//! Polls a pool through [`PoolProbe`], keeps a bounded metrics history,
//! detects checked-out-too-long connections and optionally revokes them.

use crate::domain::entities::unix_millis;
use crate::domain::ports::{PoolProbe, QueryObserver};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MAX_QUERY_TEXT: usize = 200;

/// How chatty each monitoring tick is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Only warnings
    Quiet,
    /// Log non-healthy snapshots
    #[default]
    Normal,
    /// Log every snapshot
    Verbose,
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct ConnectionMonitorConfig {
    pub monitor_interval: Duration,
    /// Checked out longer than this is reported as a leak
    pub leak_detection_threshold: Duration,
    /// Checked out longer than this may be force-released
    pub max_leak_age: Duration,
    pub autofix: bool,
    /// Autofix only runs while the pool has more idle connections than this
    pub max_idle_connections: usize,
    pub query_time_threshold: Duration,
    /// Query history size
    pub sample_size: usize,
    pub history_size: usize,
    pub verbosity: Verbosity,
}

impl Default for ConnectionMonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            leak_detection_threshold: Duration::from_secs(60),
            max_leak_age: Duration::from_secs(5 * 60),
            autofix: false,
            max_idle_connections: 5,
            query_time_threshold: Duration::from_millis(1000),
            sample_size: 100,
            history_size: 60,
            verbosity: Verbosity::Normal,
        }
    }
}

/// Pool pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Healthy,
    Medium,
    High,
    Waiting,
}

/// Normalized pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub timestamp: u64,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max_connections: usize,
    /// Percentage of `max_connections` currently open
    pub utilization_rate: f64,
    pub status: PoolStatus,
}

impl PoolMetrics {
    pub fn from_probe(pool: &dyn PoolProbe) -> Self {
        let total = pool.total_count();
        let max = pool.max_size();
        let waiting = pool.waiting_count();

        let utilization_rate = if max == 0 {
            0.0
        } else {
            (total as f64 / max as f64 * 10_000.0).round() / 100.0
        };

        let status = if waiting > 0 {
            PoolStatus::Waiting
        } else if utilization_rate > 90.0 {
            PoolStatus::High
        } else if utilization_rate >= 70.0 {
            PoolStatus::Medium
        } else {
            PoolStatus::Healthy
        };

        Self {
            timestamp: unix_millis(),
            total,
            active: pool.active_count(),
            idle: pool.idle_count(),
            waiting,
            max_connections: max,
            utilization_rate,
            status,
        }
    }
}

/// A checked-out connection under leak surveillance.
#[derive(Debug, Clone)]
struct TrackedConnection {
    started: Instant,
    context: String,
    revoke: CancellationToken,
}

/// Handle returned by [`ConnectionMonitor::register_connection`].
///
/// The token is cancelled if the monitor force-releases the connection.
#[derive(Debug, Clone)]
pub struct ConnectionLease {
    pub id: String,
    pub revoked: CancellationToken,
}

impl ConnectionLease {
    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }
}

/// A connection held longer than the leak threshold.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub id: String,
    pub context: String,
    pub age_ms: u64,
}

/// Outcome of one monitoring tick.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub metrics: PoolMetrics,
    pub leaks: Vec<LeakReport>,
    pub force_released: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub query: String,
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: u64,
}

/// Summary over the query history window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub count: usize,
    pub failures: usize,
    pub slow: usize,
    pub average_ms: f64,
    pub max_ms: u64,
}

/// Process-lifetime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorCounters {
    pub checks: u64,
    pub leaks_detected: u64,
    pub forced_releases: u64,
    pub slow_queries: u64,
    pub tracked: usize,
}

/// Pool monitor. Owns its bookkeeping; nothing is process-global.
pub struct ConnectionMonitor {
    pool: Arc<dyn PoolProbe>,
    config: ConnectionMonitorConfig,
    active: Mutex<HashMap<String, TrackedConnection>>,
    history: Mutex<VecDeque<PoolMetrics>>,
    queries: Mutex<VecDeque<QueryRecord>>,
    checks: AtomicU64,
    leaks_detected: AtomicU64,
    forced_releases: AtomicU64,
    slow_queries: AtomicU64,
    poller: Mutex<Option<CancellationToken>>,
}

impl ConnectionMonitor {
    pub fn new(pool: Arc<dyn PoolProbe>, config: ConnectionMonitorConfig) -> Self {
        Self {
            pool,
            config,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            queries: Mutex::new(VecDeque::new()),
            checks: AtomicU64::new(0),
            leaks_detected: AtomicU64::new(0),
            forced_releases: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionMonitorConfig {
        &self.config
    }

    /// Current pool snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics::from_probe(self.pool.as_ref())
    }

    /// Snapshots recorded by `check`, oldest first.
    pub fn metrics_history(&self) -> Vec<PoolMetrics> {
        self.history.lock().iter().cloned().collect()
    }

    /// Start tracking a checked-out connection.
    pub fn register_connection(&self, context: impl Into<String>) -> ConnectionLease {
        let id = uuid::Uuid::new_v4().to_string();
        let revoke = CancellationToken::new();

        self.active.lock().insert(
            id.clone(),
            TrackedConnection {
                started: Instant::now(),
                context: context.into(),
                revoke: revoke.clone(),
            },
        );

        ConnectionLease {
            id,
            revoked: revoke,
        }
    }

    /// Stop tracking a connection. Returns false if it was unknown or already revoked.
    pub fn release_connection(&self, id: &str) -> bool {
        self.active.lock().remove(id).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Record a query outcome.
    pub fn track_query(&self, query: &str, duration: Duration, success: bool) {
        let text: String = query.chars().take(MAX_QUERY_TEXT).collect();

        if duration > self.config.query_time_threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                category = "pool",
                "slow query ({}ms > {}ms): {}",
                duration.as_millis(),
                self.config.query_time_threshold.as_millis(),
                text
            );
        }

        let mut queries = self.queries.lock();
        if queries.len() >= self.config.sample_size.max(1) {
            queries.pop_front();
        }
        queries.push_back(QueryRecord {
            query: text,
            duration_ms: duration.as_millis() as u64,
            success,
            timestamp: unix_millis(),
        });
    }

    pub fn recent_queries(&self) -> Vec<QueryRecord> {
        self.queries.lock().iter().cloned().collect()
    }

    pub fn query_stats(&self) -> QueryStats {
        let queries = self.queries.lock();
        if queries.is_empty() {
            return QueryStats::default();
        }

        let threshold = self.config.query_time_threshold.as_millis() as u64;
        let total: u64 = queries.iter().map(|q| q.duration_ms).sum();

        QueryStats {
            count: queries.len(),
            failures: queries.iter().filter(|q| !q.success).count(),
            slow: queries.iter().filter(|q| q.duration_ms > threshold).count(),
            average_ms: total as f64 / queries.len() as f64,
            max_ms: queries.iter().map(|q| q.duration_ms).max().unwrap_or(0),
        }
    }

    pub fn counters(&self) -> MonitorCounters {
        MonitorCounters {
            checks: self.checks.load(Ordering::Relaxed),
            leaks_detected: self.leaks_detected.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            tracked: self.tracked_count(),
        }
    }

    /// Run one monitoring tick.
    pub fn check(&self) -> MonitorReport {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let metrics = self.metrics();

        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(metrics.clone());
        }

        self.log_metrics(&metrics);

        let leaks = self.detect_leaks();
        let force_released = if self.config.autofix && metrics.idle > self.config.max_idle_connections {
            self.force_release_stale()
        } else {
            Vec::new()
        };

        MonitorReport {
            metrics,
            leaks,
            force_released,
        }
    }

    fn log_metrics(&self, m: &PoolMetrics) {
        let line = format!(
            "pool total={} active={} idle={} waiting={} max={} utilization={:.1}% status={:?}",
            m.total, m.active, m.idle, m.waiting, m.max_connections, m.utilization_rate, m.status
        );

        match (self.config.verbosity, m.status) {
            (_, PoolStatus::High) | (_, PoolStatus::Waiting) => {
                tracing::warn!(category = "pool", "{}", line)
            }
            (Verbosity::Quiet, _) => {}
            (Verbosity::Verbose, _) | (Verbosity::Normal, PoolStatus::Medium) => {
                tracing::info!(category = "pool", "{}", line)
            }
            (Verbosity::Normal, _) => tracing::debug!(category = "pool", "{}", line),
        }
    }

    fn detect_leaks(&self) -> Vec<LeakReport> {
        let threshold = self.config.leak_detection_threshold;
        let active = self.active.lock();

        let leaks: Vec<LeakReport> = active
            .iter()
            .filter_map(|(id, conn)| {
                let age = conn.started.elapsed();
                (age > threshold).then(|| LeakReport {
                    id: id.clone(),
                    context: conn.context.clone(),
                    age_ms: age.as_millis() as u64,
                })
            })
            .collect();

        for leak in &leaks {
            tracing::warn!(
                category = "pool",
                "possible connection leak: {} held for {}ms ({})",
                leak.id,
                leak.age_ms,
                leak.context
            );
        }
        self.leaks_detected
            .fetch_add(leaks.len() as u64, Ordering::Relaxed);
        leaks
    }

    fn force_release_stale(&self) -> Vec<String> {
        let max_age = self.config.max_leak_age;
        let mut active = self.active.lock();

        let stale: Vec<String> = active
            .iter()
            .filter(|(_, conn)| conn.started.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(conn) = active.remove(id) {
                conn.revoke.cancel();
                tracing::warn!(
                    category = "pool",
                    "force-released connection {} after {}ms ({})",
                    id,
                    conn.started.elapsed().as_millis(),
                    conn.context
                );
            }
        }
        self.forced_releases
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale
    }

    /// Start periodic checks. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *poller = Some(cancel.clone());

        let monitor = Arc::downgrade(self);
        let interval = self.config.monitor_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check();
                    }
                }
            }
        });

        tracing::info!(
            category = "pool",
            "connection monitor started (interval {}ms)",
            interval.as_millis()
        );
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.poller.lock().take() {
            cancel.cancel();
            tracing::info!(category = "pool", "connection monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller.lock().is_some()
    }
}

impl QueryObserver for ConnectionMonitor {
    fn connection_acquired(&self, context: &str) -> (String, CancellationToken) {
        let lease = self.register_connection(context);
        (lease.id, lease.revoked)
    }

    fn connection_released(&self, id: &str) {
        self.release_connection(id);
    }

    fn query_completed(&self, query: &str, duration: Duration, success: bool) {
        self.track_query(query, duration, success);
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.poller.get_mut().take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct MockPool {
        total: AtomicUsize,
        idle: AtomicUsize,
        waiting: AtomicUsize,
        max: usize,
    }

    impl MockPool {
        fn new(total: usize, idle: usize, max: usize) -> Arc<Self> {
            Arc::new(Self {
                total: AtomicUsize::new(total),
                idle: AtomicUsize::new(idle),
                waiting: AtomicUsize::new(0),
                max,
            })
        }
    }

    impl PoolProbe for MockPool {
        fn total_count(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }
        fn idle_count(&self) -> usize {
            self.idle.load(Ordering::SeqCst)
        }
        fn waiting_count(&self) -> usize {
            self.waiting.load(Ordering::SeqCst)
        }
        fn max_size(&self) -> usize {
            self.max
        }
    }

    fn monitor(pool: Arc<MockPool>, config: ConnectionMonitorConfig) -> ConnectionMonitor {
        ConnectionMonitor::new(pool, config)
    }

    #[test]
    fn test_utilization_thresholds() {
        let pool = MockPool::new(8, 2, 10);
        let m = monitor(pool.clone(), ConnectionMonitorConfig::default());

        let metrics = m.metrics();
        assert_eq!(metrics.utilization_rate, 80.0);
        assert_eq!(metrics.status, PoolStatus::Medium);
        assert_eq!(metrics.active, 6);

        pool.total.store(10, Ordering::SeqCst);
        assert_eq!(m.metrics().status, PoolStatus::High);

        pool.total.store(5, Ordering::SeqCst);
        assert_eq!(m.metrics().status, PoolStatus::Healthy);

        pool.total.store(7, Ordering::SeqCst);
        assert_eq!(m.metrics().status, PoolStatus::Medium);
    }

    #[test]
    fn test_waiting_overrides_utilization() {
        let pool = MockPool::new(1, 0, 10);
        pool.waiting.store(2, Ordering::SeqCst);
        let m = monitor(pool, ConnectionMonitorConfig::default());
        assert_eq!(m.metrics().status, PoolStatus::Waiting);
    }

    #[test]
    fn test_zero_max_size() {
        let m = monitor(MockPool::new(0, 0, 0), ConnectionMonitorConfig::default());
        assert_eq!(m.metrics().utilization_rate, 0.0);
        assert_eq!(m.metrics().status, PoolStatus::Healthy);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = ConnectionMonitorConfig {
            history_size: 3,
            ..Default::default()
        };
        let m = monitor(MockPool::new(1, 1, 10), config);
        for _ in 0..5 {
            m.check();
        }
        assert_eq!(m.metrics_history().len(), 3);
        assert_eq!(m.counters().checks, 5);
    }

    #[test]
    fn test_register_and_release() {
        let m = monitor(MockPool::new(1, 0, 10), ConnectionMonitorConfig::default());
        let lease = m.register_connection("GET /api/users/1");
        assert_eq!(m.tracked_count(), 1);
        assert!(m.release_connection(&lease.id));
        assert!(!m.release_connection(&lease.id));
        assert_eq!(m.tracked_count(), 0);
    }

    #[test]
    #[traced_test]
    fn test_leak_detection_warns() {
        let config = ConnectionMonitorConfig {
            leak_detection_threshold: Duration::from_millis(5),
            ..Default::default()
        };
        let m = monitor(MockPool::new(2, 0, 10), config);
        let lease = m.register_connection("report export");
        std::thread::sleep(Duration::from_millis(10));

        let report = m.check();
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].id, lease.id);
        assert!(report.force_released.is_empty());
        assert!(!lease.is_revoked());
        assert!(logs_contain("possible connection leak"));
        assert_eq!(m.counters().leaks_detected, 1);
    }

    #[test]
    fn test_autofix_force_releases_when_idle_high() {
        let config = ConnectionMonitorConfig {
            leak_detection_threshold: Duration::from_millis(1),
            max_leak_age: Duration::from_millis(5),
            autofix: true,
            max_idle_connections: 2,
            ..Default::default()
        };
        let pool = MockPool::new(6, 1, 10);
        let m = monitor(pool.clone(), config);
        let stale = m.register_connection("stale");
        std::thread::sleep(Duration::from_millis(10));

        // idle below the limit: leak reported, nothing released
        let report = m.check();
        assert_eq!(report.leaks.len(), 1);
        assert!(report.force_released.is_empty());

        pool.idle.store(4, Ordering::SeqCst);
        let fresh = m.register_connection("fresh");
        let report = m.check();

        assert_eq!(report.force_released, vec![stale.id.clone()]);
        assert!(stale.is_revoked());
        assert!(!fresh.is_revoked());
        assert_eq!(m.tracked_count(), 1);
        assert_eq!(m.counters().forced_releases, 1);
    }

    #[test]
    #[traced_test]
    fn test_track_query_and_stats() {
        let config = ConnectionMonitorConfig {
            query_time_threshold: Duration::from_millis(100),
            sample_size: 3,
            ..Default::default()
        };
        let m = monitor(MockPool::new(1, 1, 10), config);

        m.track_query("SELECT 1", Duration::from_millis(10), true);
        m.track_query("SELECT * FROM users", Duration::from_millis(250), true);
        m.track_query("INSERT INTO users", Duration::from_millis(30), false);
        m.track_query("SELECT 2", Duration::from_millis(20), true);

        let stats = m.query_stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.slow, 1);
        assert_eq!(stats.max_ms, 250);
        assert_eq!(m.recent_queries()[0].query, "SELECT * FROM users");
        assert!(logs_contain("slow query"));
    }

    #[test]
    fn test_long_query_text_truncated() {
        let m = monitor(MockPool::new(1, 1, 10), ConnectionMonitorConfig::default());
        m.track_query(&"x".repeat(500), Duration::from_millis(1), true);
        assert_eq!(m.recent_queries()[0].query.len(), MAX_QUERY_TEXT);
    }

    #[tokio::test]
    async fn test_start_polls_until_stopped() {
        let config = ConnectionMonitorConfig {
            monitor_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let m = Arc::new(monitor(MockPool::new(1, 1, 10), config));

        m.start();
        m.start();
        assert!(m.is_running());
        tokio::time::sleep(Duration::from_millis(55)).await;
        m.stop();
        assert!(!m.is_running());

        let checks = m.counters().checks;
        assert!(checks >= 3, "expected several ticks, got {}", checks);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(m.counters().checks, checks);
    }
}
