//! Integration tests for staged startup
//!
//! The database and route registrar used here never complete, so these tests
//! show which handles are live at each phase and that shutdown still runs.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ireva_server::adapters::inbound::{ApiRoutes, AppRouter};
use ireva_server::application::{BootPhase, Bootstrapper};
use ireva_server::config::Config;
use ireva_server::domain::entities::{NewUser, Session, User};
use ireva_server::domain::errors::StorageError;
use ireva_server::domain::ports::{
    ConnectionState, Database, PoolProbe, RouteRegistrar, SessionStore, Storage,
};
use ireva_server::infrastructure::{HealthMonitorConfig, OverallStatus};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

#[derive(Default)]
struct HangingDatabase {
    connects: AtomicUsize,
    closed: AtomicBool,
}

struct HangingSessions;

#[async_trait]
impl SessionStore for HangingSessions {
    async fn get(&self, _sid: &str) -> Result<Option<Session>, StorageError> {
        std::future::pending().await
    }
    async fn set(&self, _session: Session) -> Result<(), StorageError> {
        std::future::pending().await
    }
    async fn destroy(&self, _sid: &str) -> Result<(), StorageError> {
        std::future::pending().await
    }
    async fn prune_expired(&self) -> Result<usize, StorageError> {
        std::future::pending().await
    }
}

#[async_trait]
impl Storage for HangingDatabase {
    async fn get_user(&self, _id: i64) -> Result<Option<User>, StorageError> {
        std::future::pending().await
    }
    async fn get_user_by_username(&self, _username: &str) -> Result<Option<User>, StorageError> {
        std::future::pending().await
    }
    async fn create_user(&self, _user: NewUser) -> Result<User, StorageError> {
        std::future::pending().await
    }
    async fn ping(&self) -> Result<(), StorageError> {
        std::future::pending().await
    }
    fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::new(HangingSessions)
    }
}

#[async_trait]
impl Database for HangingDatabase {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
    fn state(&self) -> ConnectionState {
        ConnectionState::Pending
    }
    fn pool(&self) -> Option<Arc<dyn PoolProbe>> {
        None
    }
    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct HangingRegistrar;

#[async_trait]
impl RouteRegistrar for HangingRegistrar {
    async fn register_routes(&self, _router: Router, _storage: Arc<dyn Storage>) -> anyhow::Result<Router> {
        std::future::pending().await
    }
}

fn config() -> Config {
    Config {
        boot_background_delay_ms: 10,
        shutdown_timeout_ms: 1_000,
        shutdown_force_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn quiet_health() -> HealthMonitorConfig {
    HealthMonitorConfig {
        system_checks: false,
        check_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn status_of(router: Router, uri: &str) -> StatusCode {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.oneshot(req).await.unwrap().status()
}

/// Phase 1 returns immediately even though every later dependency hangs
#[tokio::test]
async fn test_essential_phase_returns_before_dependencies() {
    let database = Arc::new(HangingDatabase::default());
    let exit_code = Arc::new(AtomicI32::new(-1));
    let code = exit_code.clone();

    let started = Instant::now();
    let handles = Bootstrapper::new(config(), AppRouter::new(), database.clone())
        .with_health_config(quiet_health())
        .with_registrar(Arc::new(HangingRegistrar))
        .with_exit(Arc::new(move |c| code.store(c, Ordering::SeqCst)))
        .bootstrap();
    assert!(started.elapsed() < Duration::from_millis(50));

    let progress = handles.progress();
    assert!(progress.essential);
    assert!(!progress.core);
    assert!(!progress.background);

    // Health routes are live; everything else is still starting
    let router = handles.app.router();
    assert_eq!(status_of(router.clone(), "/health").await, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(status_of(router.clone(), "/api/users/1").await, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(handles.health.overall(), OverallStatus::Initializing);

    // Background phase reaches the connect step and blocks there
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(database.connects.load(Ordering::SeqCst), 1);
    assert!(handles.services.breakers().is_some());
    assert!(handles.services.cache().is_some());
    assert!(handles.services.connection_monitor().is_none());
    assert!(!handles.progress().background);

    // Shutdown still runs every cleanup and interrupts the stuck phases
    let report = handles.shutdown.shutdown("SIGTERM").await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(database.closed.load(Ordering::SeqCst));
    assert_eq!(exit_code.load(Ordering::SeqCst), 0);
    assert_eq!(status_of(router, "/health").await, StatusCode::SERVICE_UNAVAILABLE);

    assert!(!handles.wait_for(BootPhase::Core).await);
    assert!(!handles.wait_for(BootPhase::Background).await);
}

/// Routes registered by the core phase go live while the database still hangs
#[tokio::test]
async fn test_core_phase_installs_routes_while_database_hangs() {
    let database = Arc::new(HangingDatabase::default());
    let app = AppRouter::new();
    let bootstrapper = Bootstrapper::new(config(), app.clone(), database)
        .with_health_config(quiet_health())
        .with_exit(Arc::new(|_| {}));
    let routes = Arc::new(ApiRoutes::with_services(bootstrapper.services()));
    let handles = bootstrapper.with_registrar(routes).bootstrap();

    assert!(handles.wait_for(BootPhase::Core).await);

    let router = app.router();
    assert_eq!(status_of(router.clone(), "/api/version").await, StatusCode::OK);
    assert_eq!(status_of(router.clone(), "/missing").await, StatusCode::NOT_FOUND);
    assert_eq!(status_of(router, "/health").await, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        handles.health.record("auth").map(|r| r.status),
        Some(ireva_server::infrastructure::HealthState::Healthy)
    );
    assert!(handles.shutdown.registered().contains(&"sessions".to_string()));

    handles.shutdown.shutdown("test").await;
}
