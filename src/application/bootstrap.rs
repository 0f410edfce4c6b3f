//! Bootstrapper - staged application startup
//!
//! Brings the process up in three tiers so the listener can be bound before
//! the database connects:
//!
//! 1. Essential (synchronous): health monitor, shutdown coordinator, lazy
//!    database handle, health routes. Returns control to the caller.
//! 2. Core (spawned): cache manager, auth wiring, route registration and the
//!    connection monitor when a pool is already live.
//! 3. Background (spawned after a short delay): circuit breakers, retry
//!    handlers, then the database connect step through the retry handler.
//!
//! Every sub-step logs its failure and leaves its slot empty; nothing aborts
//! the boot.

use crate::adapters::inbound::{not_found, ops_routes, starting_up, AppRouter, OpsState};
use crate::application::core_services::{CoreServices, DATABASE_RETRY, STORAGE_RETRY};
use crate::config::Config;
use crate::domain::errors::{InitializationError, StorageError};
use crate::domain::ports::{Database, PoolProbe, RouteRegistrar, SessionStore, Storage};
use crate::infrastructure::{
    CacheManager, CircuitBreakerConfig, CircuitBreakerRegistry, ConnectionMonitor,
    ConnectionMonitorConfig, DatabaseCheck, ExitFn, GracefulShutdown, HealthMonitor,
    HealthMonitorConfig, HealthState, LogCategory, Logger, PerformanceTracker, RetryConfig,
    RetryHandler, ShutdownConfig,
};
use axum::Router;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const LOG: Logger = Logger::new(LogCategory::Startup);

/// Push-reported health record for session and auth wiring.
pub const AUTH_CHECK: &str = "auth";

// Cleanup priorities; lower runs first.
pub const PRIORITY_APP: i32 = 10;
pub const PRIORITY_SERVICES: i32 = 15;
pub const PRIORITY_DATABASE: i32 = 20;
pub const PRIORITY_LISTENER: i32 = 30;

const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const GENERATED_SECRET_LEN: usize = 48;
const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Essential,
    Core,
    Background,
}

/// Which phases have finished. Core and background run concurrently, so
/// either may finish first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootProgress {
    pub essential: bool,
    pub core: bool,
    pub background: bool,
}

impl BootProgress {
    pub fn reached(&self, phase: BootPhase) -> bool {
        match phase {
            BootPhase::Essential => self.essential,
            BootPhase::Core => self.core,
            BootPhase::Background => self.background,
        }
    }
}

/// Handles available once the essential phase returns.
pub struct BootHandles {
    pub database: Arc<dyn Database>,
    pub health: Arc<HealthMonitor>,
    pub shutdown: GracefulShutdown,
    pub tracker: PerformanceTracker,
    pub services: Arc<CoreServices>,
    pub app: AppRouter,
    progress: watch::Receiver<BootProgress>,
}

impl BootHandles {
    pub fn progress(&self) -> BootProgress {
        *self.progress.borrow()
    }

    /// Wait until `phase` has finished. Returns false if the phase task ended
    /// without finishing, for example because shutdown interrupted it.
    pub async fn wait_for(&self, phase: BootPhase) -> bool {
        let mut rx = self.progress.clone();
        loop {
            if rx.borrow_and_update().reached(phase) {
                return true;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().reached(phase);
            }
        }
    }
}

/// Shared by the spawned phases.
#[derive(Clone)]
struct Essentials {
    health: Arc<HealthMonitor>,
    shutdown: GracefulShutdown,
    tracker: PerformanceTracker,
    progress: Arc<watch::Sender<BootProgress>>,
}

/// Staged startup with explicit dependencies.
pub struct Bootstrapper {
    config: Config,
    app: AppRouter,
    database: Arc<dyn Database>,
    storage: Arc<dyn Storage>,
    registrar: Option<Arc<dyn RouteRegistrar>>,
    services: Arc<CoreServices>,
    exit: Option<ExitFn>,
    health_config: HealthMonitorConfig,
    monitor_config: ConnectionMonitorConfig,
    breaker_config: CircuitBreakerConfig,
    database_retry: RetryConfig,
    storage_retry: RetryConfig,
}

impl Bootstrapper {
    pub fn new<D: Database + 'static>(config: Config, app: AppRouter, database: Arc<D>) -> Self {
        let health_config = HealthMonitorConfig {
            check_interval: config.health_check_interval(),
            health_token: config.health_check_token.clone(),
            ..Default::default()
        };

        Self {
            config,
            app,
            storage: database.clone(),
            database,
            registrar: None,
            services: Arc::new(CoreServices::new()),
            exit: None,
            health_config,
            monitor_config: ConnectionMonitorConfig::default(),
            breaker_config: CircuitBreakerConfig::default(),
            database_retry: RetryConfig::default(),
            storage_retry: RetryConfig {
                retries: 2,
                min_timeout: Duration::from_millis(100),
                max_timeout: Duration::from_secs(2),
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn RouteRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Replace the process exit used by the shutdown coordinator.
    pub fn with_exit(mut self, exit: ExitFn) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn with_health_config(mut self, config: HealthMonitorConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn with_monitor_config(mut self, config: ConnectionMonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Retry policy for the database connect step.
    pub fn with_database_retry(mut self, config: RetryConfig) -> Self {
        self.database_retry = config;
        self
    }

    /// Retry policy for storage reads made by route handlers.
    pub fn with_storage_retry(mut self, config: RetryConfig) -> Self {
        self.storage_retry = config;
        self
    }

    /// Slots filled by the later phases. Registrars may hold on to it.
    pub fn services(&self) -> Arc<CoreServices> {
        self.services.clone()
    }

    /// Run the essential phase and spawn the others. Must be called within a
    /// tokio runtime.
    pub fn bootstrap(self) -> BootHandles {
        let tracker = PerformanceTracker::new();
        let mut timer = tracker.start("bootstrap.essential");
        LOG.info(format!(
            "bootstrapping {} v{} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.config.node_env
        ));

        let health = Arc::new(HealthMonitor::new(self.health_config.clone()));
        health.register_check(Arc::new(DatabaseCheck::new(self.database.clone())));
        health.track(AUTH_CHECK);
        for (name, url) in &self.config.external_health_apis {
            health.register_external_api(name, url);
        }
        health.start();
        timer.checkpoint("health");

        let shutdown_config = ShutdownConfig {
            timeout: self.config.shutdown_timeout(),
            force_timeout: self.config.shutdown_force_timeout(),
            ..Default::default()
        };
        let shutdown = match &self.exit {
            Some(exit) => GracefulShutdown::with_exit(shutdown_config, exit.clone()),
            None => GracefulShutdown::new(shutdown_config),
        };
        self.register_essential_cleanups(&shutdown, &health);
        timer.checkpoint("shutdown");

        let ops = ops_routes(OpsState {
            health: health.clone(),
            services: self.services.clone(),
            tracker: tracker.clone(),
        });
        self.app.install(ops.clone().fallback(starting_up));
        timer.checkpoint("routes");
        timer.finish();

        let (progress_tx, progress_rx) = watch::channel(BootProgress {
            essential: true,
            ..Default::default()
        });

        let essentials = Essentials {
            health: health.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            progress: Arc::new(progress_tx),
        };

        let handles = BootHandles {
            database: self.database.clone(),
            health,
            shutdown,
            tracker,
            services: self.services.clone(),
            app: self.app.clone(),
            progress: progress_rx,
        };

        let boot = Arc::new(self);

        {
            let boot = boot.clone();
            let essentials = essentials.clone();
            tokio::spawn(async move {
                let mut interrupted = essentials.shutdown.subscribe();
                tokio::select! {
                    _ = boot.core_phase(ops, &essentials) => {
                        essentials.progress.send_modify(|p| p.core = true);
                    }
                    _ = interrupted.recv() => {
                        LOG.warn("core phase interrupted by shutdown");
                    }
                }
            });
        }

        let delay = boot.config.boot_background_delay();
        tokio::spawn(async move {
            let mut interrupted = essentials.shutdown.subscribe();
            tokio::select! {
                _ = async {
                    tokio::time::sleep(delay).await;
                    boot.background_phase(&essentials).await;
                } => {
                    essentials.progress.send_modify(|p| p.background = true);
                }
                _ = interrupted.recv() => {
                    LOG.warn("background phase interrupted by shutdown");
                }
            }
        });

        handles
    }

    fn register_essential_cleanups(&self, shutdown: &GracefulShutdown, health: &Arc<HealthMonitor>) {
        let app = self.app.clone();
        shutdown.register("app", PRIORITY_APP, move || async move {
            app.begin_draining();
            Ok(())
        });

        let health = health.clone();
        shutdown.register("health-monitor", PRIORITY_SERVICES, move || async move {
            health.stop();
            Ok(())
        });

        let database = self.database.clone();
        shutdown.register("database", PRIORITY_DATABASE, move || async move {
            database.close().await?;
            Ok(())
        });
    }

    async fn core_phase(&self, ops: Router, essentials: &Essentials) {
        let mut timer = essentials.tracker.start("bootstrap.core");

        self.init_cache(&essentials.shutdown);
        timer.checkpoint("cache");

        let router = self.init_routes(ops, essentials).await;
        self.app.install(router.fallback(not_found));
        timer.checkpoint("routes");

        match self.database.pool() {
            Some(pool) => {
                self.init_connection_monitor(pool, &essentials.shutdown);
                timer.checkpoint("connection-monitor");
            }
            None => LOG.debug("no live pool yet; connection monitor deferred"),
        }

        timer.finish();
    }

    fn init_cache(&self, shutdown: &GracefulShutdown) {
        let cache = Arc::new(CacheManager::new(CACHE_CLEANUP_INTERVAL));
        cache.start_cleanup();
        self.services.set_cache(cache.clone());

        shutdown.register("cache", PRIORITY_SERVICES, move || async move {
            cache.stop();
            cache.clear_all();
            Ok(())
        });
    }

    /// Essential routes, auth wiring and application routes, in that order.
    /// A failing step keeps the router built before it.
    async fn init_routes(&self, ops: Router, essentials: &Essentials) -> Router {
        let health = &essentials.health;
        let secret = self.session_secret();
        let Some(registrar) = &self.registrar else {
            health.report(
                AUTH_CHECK,
                HealthState::Warning,
                Some("no route registrar; sessions not wired".to_string()),
            );
            LOG.warn("no route registrar configured; serving health routes only");
            return ops;
        };
        let storage = self.storage.clone();

        let router = match registrar.register_essential_routes(ops.clone()).await {
            Ok(router) => router,
            Err(e) => {
                LOG.error(InitializationError::new("essential routes", format!("{:#}", e)));
                ops
            }
        };

        let router = match registrar
            .register_auth(router.clone(), storage.clone(), &secret)
            .await
        {
            Ok(router) => {
                health.report(AUTH_CHECK, HealthState::Healthy, None);
                spawn_session_pruning(storage.session_store(), &essentials.shutdown);
                router
            }
            Err(e) => {
                let err = InitializationError::new("auth", format!("{:#}", e));
                LOG.error(&err);
                health.report(AUTH_CHECK, HealthState::Degraded, Some(err.to_string()));
                router
            }
        };

        match registrar.register_routes(router.clone(), storage).await {
            Ok(router) => router,
            Err(e) => {
                LOG.error(InitializationError::new("routes", format!("{:#}", e)));
                router
            }
        }
    }

    fn session_secret(&self) -> String {
        if let Some(secret) = &self.config.session_secret {
            return secret.clone();
        }

        if self.config.is_production() {
            LOG.error("SESSION_SECRET is not set; sessions will not survive a restart");
        } else {
            LOG.warn("SESSION_SECRET is not set; using a generated secret");
        }
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_SECRET_LEN)
            .map(char::from)
            .collect()
    }

    fn init_connection_monitor(&self, pool: Arc<dyn PoolProbe>, shutdown: &GracefulShutdown) {
        let monitor = Arc::new(ConnectionMonitor::new(pool, self.monitor_config.clone()));
        if !self.services.set_connection_monitor(monitor.clone()) {
            return;
        }

        self.database.set_observer(monitor.clone());
        monitor.start();

        shutdown.register("connection-monitor", PRIORITY_SERVICES, move || async move {
            monitor.stop();
            Ok(())
        });
    }

    async fn background_phase(&self, essentials: &Essentials) {
        let mut timer = essentials.tracker.start("bootstrap.background");

        let registry = Arc::new(CircuitBreakerRegistry::new(self.breaker_config.clone()));
        self.services.set_breakers(registry.clone());

        let database_retry =
            RetryHandler::new(DATABASE_RETRY, self.database_retry.clone(), Some(&registry));
        self.services.add_retry_handler(database_retry.clone());
        self.services.add_retry_handler(RetryHandler::new(
            STORAGE_RETRY,
            self.storage_retry.clone(),
            Some(&registry),
        ));
        timer.checkpoint("resilience");

        let database = self.database.clone();
        let connected = database_retry
            .retry(move |cancel| {
                let database = database.clone();
                async move {
                    tokio::select! {
                        connected = database.connect() => connected,
                        _ = cancel.cancelled() => Err(StorageError::Revoked),
                    }
                }
            })
            .await;

        match connected {
            Ok(()) => LOG.info("database connected"),
            Err(e) => LOG.error(InitializationError::new("database", e)),
        }
        timer.checkpoint("database");

        if let Some(pool) = self.database.pool() {
            self.init_connection_monitor(pool, &essentials.shutdown);
        }

        let status = essentials.health.check_health().await;
        LOG.info(format!("background services ready; health is {:?}", status));
        timer.finish();
    }
}

/// Delete expired sessions every `SESSION_PRUNE_INTERVAL` until shutdown.
fn spawn_session_pruning(store: Arc<dyn SessionStore>, shutdown: &GracefulShutdown) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_PRUNE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pruned = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                pruned = store.prune_expired() => pruned,
            };
            match pruned {
                Ok(0) => {}
                Ok(n) => LOG.debug(format!("pruned {} expired sessions", n)),
                Err(e) => LOG.warn(format!("session pruning failed: {}", e)),
            }
        }
    });

    shutdown.register("sessions", PRIORITY_SERVICES, move || async move {
        cancel.cancel();
        let _ = task.await;
        Ok(())
    });
}
