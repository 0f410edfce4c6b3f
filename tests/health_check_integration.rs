//! Integration tests for Health Monitoring with Wiremock
//!
//! External API checks against mock servers, and the tiered health endpoint
//! served through the application router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ireva_server::adapters::inbound::{ops_routes, AppRouter, OpsState, HEALTH_TOKEN_HEADER};
use ireva_server::application::CoreServices;
use ireva_server::infrastructure::{
    HealthMonitor, HealthMonitorConfig, HealthState, OverallStatus, PerformanceTracker,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn monitor(token: Option<&str>) -> Arc<HealthMonitor> {
    Arc::new(HealthMonitor::new(HealthMonitorConfig {
        system_checks: false,
        external_timeout: Duration::from_millis(300),
        check_timeout: Duration::from_secs(2),
        health_token: token.map(String::from),
        ..Default::default()
    }))
}

async fn mock_api(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

async fn get_json(app: axum::Router, uri: &str, token: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(HEALTH_TOKEN_HEADER, token);
    }
    let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// A 2xx response marks the external API healthy
#[tokio::test]
async fn test_external_api_healthy() {
    let server = mock_api(200).await;
    let health = monitor(None);
    health.register_external_api("payments", &format!("{}/health", server.uri()));

    assert_eq!(health.overall(), OverallStatus::Initializing);
    assert_eq!(health.check_health().await, OverallStatus::Healthy);

    let record = health.record("payments").unwrap();
    assert_eq!(record.status, HealthState::Healthy);
    assert!(record.last_check.is_some());
    assert!(record.response_time_ms.is_some());
}

/// A non-2xx response degrades the aggregate and is recorded as an issue
#[tokio::test]
async fn test_external_api_error_status_degrades() {
    let server = mock_api(503).await;
    let health = monitor(None);
    health.register_external_api("payments", &format!("{}/health", server.uri()));

    assert_eq!(health.check_health().await, OverallStatus::Degraded);
    assert_eq!(OverallStatus::Degraded.http_status(), 200);

    let record = health.record("payments").unwrap();
    assert_eq!(record.status, HealthState::Degraded);
    assert!(record.error.unwrap().contains("503"));

    let snapshot = health.status();
    assert_eq!(snapshot.recent_issues.len(), 1);
    assert_eq!(snapshot.recent_issues[0].check, "payments");
}

/// A response slower than the external timeout degrades the check
#[tokio::test]
async fn test_external_api_slow_response_degrades() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let health = monitor(None);
    health.register_external_api("maps", &format!("{}/health", server.uri()));

    assert_eq!(health.check_health().await, OverallStatus::Degraded);
    let record = health.record("maps").unwrap();
    assert!(record.error.unwrap().starts_with("request failed"));
}

/// An unreachable API is degraded, never unhealthy
#[tokio::test]
async fn test_external_api_unreachable_degrades() {
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let health = monitor(None);
    health.register_external_api("gone", &format!("{}/health", uri));

    assert_eq!(health.check_health().await, OverallStatus::Degraded);
}

/// One failing API does not affect the record of another
#[tokio::test]
async fn test_external_apis_are_independent() {
    let up = mock_api(200).await;
    let down = mock_api(500).await;

    let health = monitor(None);
    health.register_external_api("up", &format!("{}/health", up.uri()));
    health.register_external_api("down", &format!("{}/health", down.uri()));
    health.check_health().await;

    assert_eq!(health.record("up").unwrap().status, HealthState::Healthy);
    assert_eq!(health.record("down").unwrap().status, HealthState::Degraded);
}

/// Polling runs checks without an explicit call
#[tokio::test]
async fn test_polling_hits_external_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2..)
        .mount(&server)
        .await;

    let health = Arc::new(HealthMonitor::new(HealthMonitorConfig {
        system_checks: false,
        check_interval: Duration::from_millis(50),
        ..Default::default()
    }));
    health.register_external_api("payments", &format!("{}/health", server.uri()));
    health.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    health.stop();

    assert_eq!(health.overall(), OverallStatus::Healthy);
}

/// Health tiers served through the swappable application router
#[tokio::test]
async fn test_health_tiers_through_app_router() {
    let server = mock_api(502).await;
    let health = monitor(Some("ops-token"));
    health.register_external_api("payments", &format!("{}/health", server.uri()));

    let app = AppRouter::new();
    app.install(ops_routes(OpsState {
        health: health.clone(),
        services: Arc::new(CoreServices::new()),
        tracker: PerformanceTracker::new(),
    }));
    let router = app.router();

    let (status, body) = get_json(router.clone(), "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "initializing");

    health.check_health().await;

    let (status, body) = get_json(router.clone(), "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert!(body.get("checks").is_none());

    let (_, body) = get_json(router.clone(), "/health?details=true", None).await;
    assert_eq!(body["checks"]["payments"]["status"], "degraded");
    assert!(body["checks"]["payments"].get("error").is_none());

    let (_, body) = get_json(router, "/health?private=true", Some("ops-token")).await;
    assert!(body["checks"]["payments"]["error"]
        .as_str()
        .unwrap()
        .contains("502"));
    assert_eq!(body["recent_issues"][0]["check"], "payments");
}
