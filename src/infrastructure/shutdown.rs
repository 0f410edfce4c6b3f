//! Graceful Shutdown Coordinator
//!
//! Runs registered cleanups in ascending priority order when the process is
//! asked to stop, bounded by a timeout and backed by a force-exit timer.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Shutdown reason used by the panic hook. Always exits non-zero.
pub const PANIC_REASON: &str = "panic";

/// Process exit hook. `std::process::exit` outside of tests.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for the whole cleanup sequence
    pub timeout: Duration,
    /// Extra grace after `timeout` before the process is force-exited
    pub force_timeout: Duration,
    /// Call the exit hook once cleanups finish
    pub exit_on_complete: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            force_timeout: Duration::from_secs(5),
            exit_on_complete: true,
        }
    }
}

struct RegisteredService {
    priority: i32,
    seq: u64,
    cleanup: CleanupFn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "error")]
pub enum CleanupOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    /// Still running, or never started, when the timeout hit
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub name: String,
    pub priority: i32,
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
    pub elapsed_ms: u64,
}

/// What happened during shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    pub results: Vec<CleanupResult>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        let clean = !self.timed_out
            && self.reason != PANIC_REASON
            && self
                .results
                .iter()
                .all(|r| r.outcome == CleanupOutcome::Completed);
        if clean {
            0
        } else {
            1
        }
    }

    /// Names in the order they ran.
    pub fn order(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }
}

struct Inner {
    config: ShutdownConfig,
    initiated: AtomicBool,
    services: Mutex<HashMap<String, RegisteredService>>,
    seq: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    exit: ExitFn,
    report: Mutex<Option<ShutdownReport>>,
}

/// Coordinates cleanup on termination.
///
/// Cheap to clone; clones share registrations and the shutdown flag.
#[derive(Clone)]
pub struct GracefulShutdown {
    inner: Arc<Inner>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        Self::with_exit(config, Arc::new(|code| std::process::exit(code)))
    }

    /// Build with a custom exit hook.
    pub fn with_exit(config: ShutdownConfig, exit: ExitFn) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                initiated: AtomicBool::new(false),
                services: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                shutdown_tx,
                exit,
                report: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.inner.config
    }

    /// Register a cleanup. Lower priorities run first; a repeated name replaces the earlier entry.
    pub fn register<F, Fut>(&self, name: &str, priority: i32, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            tracing::warn!(
                category = "shutdown",
                "ignoring registration of {} during shutdown",
                name
            );
            return;
        }

        let service = RegisteredService {
            priority,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            cleanup: Box::new(move || Box::pin(cleanup()) as CleanupFuture),
        };

        let replaced = self
            .inner
            .services
            .lock()
            .insert(name.to_string(), service)
            .is_some();

        tracing::debug!(
            category = "shutdown",
            "{} {} (priority {})",
            if replaced { "replaced" } else { "registered" },
            name,
            priority
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.services.lock().remove(name).is_some()
    }

    /// Registered names in the order they would run.
    pub fn registered(&self) -> Vec<String> {
        let services = self.inner.services.lock();
        let mut entries: Vec<(&String, &RegisteredService)> = services.iter().collect();
        entries.sort_by_key(|(_, s)| (s.priority, s.seq));
        entries.into_iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.initiated.load(Ordering::SeqCst)
    }

    /// Subscribe to the shutdown notification.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Report of the completed shutdown, if any.
    pub fn last_report(&self) -> Option<ShutdownReport> {
        self.inner.report.lock().clone()
    }

    /// Run the shutdown sequence. Returns None if shutdown was already initiated.
    pub async fn shutdown(&self, reason: &str) -> Option<ShutdownReport> {
        if self.inner.initiated.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                category = "shutdown",
                "shutdown already in progress, ignoring {}",
                reason
            );
            return None;
        }

        let started = Instant::now();
        let config = self.inner.config.clone();
        tracing::info!(category = "shutdown", "initiating graceful shutdown ({})", reason);
        let _ = self.inner.shutdown_tx.send(());

        let force_exit = {
            let exit = self.inner.exit.clone();
            let grace = config.timeout + config.force_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                tracing::error!(
                    category = "shutdown",
                    "shutdown did not finish within {}ms, forcing exit",
                    grace.as_millis()
                );
                exit(1);
            })
        };

        let mut services: Vec<(String, RegisteredService)> =
            self.inner.services.lock().drain().collect();
        services.sort_by_key(|(_, s)| (s.priority, s.seq));
        let planned: Vec<(String, i32)> = services
            .iter()
            .map(|(name, s)| (name.clone(), s.priority))
            .collect();

        let results: Arc<Mutex<Vec<CleanupResult>>> = Arc::new(Mutex::new(Vec::new()));
        let current: Arc<Mutex<Option<AbortHandle>>> = Arc::new(Mutex::new(None));

        let sequence = run_sequence(services, results.clone(), current.clone());
        let timed_out = tokio::time::timeout(config.timeout, sequence).await.is_err();

        if timed_out {
            if let Some(handle) = current.lock().take() {
                handle.abort();
            }
            tracing::warn!(
                category = "shutdown",
                "cleanup exceeded {}ms, continuing to exit",
                config.timeout.as_millis()
            );
        }

        let mut results = std::mem::take(&mut *results.lock());
        for (name, priority) in planned.into_iter().skip(results.len()) {
            results.push(CleanupResult {
                name,
                priority,
                outcome: CleanupOutcome::TimedOut,
                elapsed_ms: 0,
            });
        }

        let report = ShutdownReport {
            reason: reason.to_string(),
            results,
            timed_out,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        *self.inner.report.lock() = Some(report.clone());

        tracing::info!(
            category = "shutdown",
            "shutdown complete in {}ms (exit code {})",
            report.elapsed_ms,
            report.exit_code()
        );

        force_exit.abort();
        if config.exit_on_complete {
            (self.inner.exit)(report.exit_code());
        }
        Some(report)
    }

    /// Wait for SIGINT or SIGTERM, then shut down.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn listen_for_signals(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(category = "shutdown", "failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(category = "shutdown", "failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let reason = tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = terminate => "SIGTERM",
        };

        tracing::info!(category = "shutdown", "received {}", reason);
        self.shutdown(reason).await;
    }

    /// Shut down when a thread outside the tokio runtime panics.
    ///
    /// Panics inside runtime tasks are caught by their `JoinHandle` and are
    /// only logged here. Call from within the runtime.
    pub fn install_panic_hook(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(category = "shutdown", "no tokio runtime, panic hook not installed");
            return;
        };
        let coordinator = self.clone();
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            previous(info);

            if tokio::runtime::Handle::try_current().is_ok() {
                tracing::error!(category = "shutdown", "panic in runtime task: {}", info);
                return;
            }

            tracing::error!(category = "shutdown", "uncaught panic: {}", info);
            let coordinator = coordinator.clone();
            runtime.spawn(async move {
                coordinator.shutdown(PANIC_REASON).await;
            });
        }));
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new(ShutdownConfig::default())
    }
}

async fn run_sequence(
    services: Vec<(String, RegisteredService)>,
    results: Arc<Mutex<Vec<CleanupResult>>>,
    current: Arc<Mutex<Option<AbortHandle>>>,
) {
    for (name, service) in services {
        let started = Instant::now();
        tracing::info!(category = "shutdown", "stopping {} (priority {})", name, service.priority);

        let task = tokio::spawn((service.cleanup)());
        *current.lock() = Some(task.abort_handle());

        let outcome = match task.await {
            Ok(Ok(())) => CleanupOutcome::Completed,
            Ok(Err(e)) => {
                tracing::error!(category = "shutdown", "cleanup of {} failed: {:#}", name, e);
                CleanupOutcome::Failed(format!("{:#}", e))
            }
            Err(e) => {
                tracing::error!(category = "shutdown", "cleanup of {} panicked: {}", name, e);
                CleanupOutcome::Panicked(e.to_string())
            }
        };
        current.lock().take();

        results.lock().push(CleanupResult {
            name,
            priority: service.priority,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn recording_exit() -> (ExitFn, Arc<AtomicI32>) {
        let code = Arc::new(AtomicI32::new(-1));
        let recorder = code.clone();
        let exit: ExitFn = Arc::new(move |c| recorder.store(c, Ordering::SeqCst));
        (exit, code)
    }

    fn coordinator(timeout: Duration) -> (GracefulShutdown, Arc<AtomicI32>) {
        let (exit, code) = recording_exit();
        let config = ShutdownConfig {
            timeout,
            force_timeout: Duration::from_millis(50),
            exit_on_complete: true,
        };
        (GracefulShutdown::with_exit(config, exit), code)
    }

    fn push_on_run(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<anyhow::Result<()>> + Send + 'static {
        let log = log.clone();
        move || {
            log.lock().push(name);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_runs_in_ascending_priority() {
        let (shutdown, code) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        shutdown.register("listener", 30, push_on_run(&log, "listener"));
        shutdown.register("app", 10, push_on_run(&log, "app"));
        shutdown.register("database", 20, push_on_run(&log, "database"));
        assert_eq!(shutdown.registered(), vec!["app", "database", "listener"]);

        let report = shutdown.shutdown("test").await.unwrap();

        assert_eq!(*log.lock(), vec!["app", "database", "listener"]);
        assert_eq!(report.order(), vec!["app", "database", "listener"]);
        assert!(!report.timed_out);
        assert_eq!(code.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_cleanup_does_not_block_later_ones() {
        let (shutdown, code) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        shutdown.register("listener", 30, push_on_run(&log, "listener"));
        shutdown.register("app", 10, push_on_run(&log, "app"));
        shutdown.register("database", 20, || async {
            Err(anyhow::anyhow!("close failed"))
        });

        let report = shutdown.shutdown("test").await.unwrap();

        assert_eq!(*log.lock(), vec!["app", "listener"]);
        assert_eq!(
            report.results[1].outcome,
            CleanupOutcome::Failed("close failed".to_string())
        );
        assert_eq!(report.results[2].outcome, CleanupOutcome::Completed);
        assert_eq!(code.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_reason_exits_non_zero() {
        let (shutdown, code) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        shutdown.register("app", 10, push_on_run(&log, "app"));

        let report = shutdown.shutdown(PANIC_REASON).await.unwrap();

        assert_eq!(report.results[0].outcome, CleanupOutcome::Completed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(code.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_is_isolated() {
        let (shutdown, _) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        shutdown.register("cache", 5, || async { panic!("boom") });
        shutdown.register("database", 20, push_on_run(&log, "database"));

        let report = shutdown.shutdown("test").await.unwrap();
        assert!(matches!(report.results[0].outcome, CleanupOutcome::Panicked(_)));
        assert_eq!(*log.lock(), vec!["database"]);
    }

    #[tokio::test]
    async fn test_hanging_cleanup_times_out() {
        let (shutdown, code) = coordinator(Duration::from_millis(50));
        let log = Arc::new(Mutex::new(Vec::new()));

        shutdown.register("app", 10, push_on_run(&log, "app"));
        shutdown.register("database", 20, || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        shutdown.register("listener", 30, push_on_run(&log, "listener"));

        let started = Instant::now();
        let report = shutdown.shutdown("test").await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(report.timed_out);
        assert_eq!(*log.lock(), vec!["app"]);
        assert_eq!(report.results[1].outcome, CleanupOutcome::TimedOut);
        assert_eq!(report.results[2].outcome, CleanupOutcome::TimedOut);
        assert_eq!(code.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (shutdown, _) = coordinator(Duration::from_secs(1));
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        shutdown.register("app", 10, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });

        let (a, b) = tokio::join!(shutdown.shutdown("SIGINT"), shutdown.shutdown("SIGTERM"));

        assert!(a.is_some() ^ b.is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_shutting_down());
        assert!(shutdown.shutdown("again").await.is_none());
        assert!(shutdown.last_report().is_some());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_and_unregister() {
        let (shutdown, _) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        shutdown.register("database", 20, push_on_run(&log, "old"));
        shutdown.register("database", 20, push_on_run(&log, "new"));
        shutdown.register("cache", 15, push_on_run(&log, "cache"));
        assert!(shutdown.unregister("cache"));
        assert!(!shutdown.unregister("cache"));

        shutdown.shutdown("test").await;
        assert_eq!(*log.lock(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_subscribers_notified() {
        let (shutdown, _) = coordinator(Duration::from_secs(1));
        let mut rx = shutdown.subscribe();

        shutdown.shutdown("test").await;

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_exit_not_called_when_disabled() {
        let (exit, code) = recording_exit();
        let shutdown = GracefulShutdown::with_exit(
            ShutdownConfig {
                exit_on_complete: false,
                ..Default::default()
            },
            exit,
        );

        let report = shutdown.shutdown("test").await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(code.load(Ordering::SeqCst), -1);
    }

    #[tokio::test]
    async fn test_registration_ignored_after_shutdown() {
        let (shutdown, _) = coordinator(Duration::from_secs(1));
        shutdown.shutdown("test").await;
        shutdown.register("late", 1, || async { Ok(()) });
        assert!(shutdown.registered().is_empty());
    }
}
