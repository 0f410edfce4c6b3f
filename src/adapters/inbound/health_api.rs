//! Health and Metrics API
//!
//! `GET /health` and `GET /api/health` answer in three tiers:
//! - minimal (default): status, uptime, timestamp
//! - full (`?full=true` or `?details=true`): adds per-subsystem status and last check
//! - private (`?private=true` plus a matching `x-health-token`): adds usage,
//!   errors, recent issues and boot timings
//!
//! `GET /api/metrics` is gated by the same token and reports whichever core
//! components are live.

use crate::application::CoreServices;
use crate::domain::entities::unix_millis;
use crate::infrastructure::{
    CacheStats, CircuitStatus, HealthIssue, HealthMonitor, HealthRecord, HealthSnapshot, HealthState,
    MonitorCounters, PerformanceTracker, PoolMetrics, QueryStats, RetryStats, TimingSummary,
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const HEALTH_TOKEN_HEADER: &str = "x-health-token";

/// State shared by the operational endpoints.
#[derive(Clone)]
pub struct OpsState {
    pub health: Arc<HealthMonitor>,
    pub services: Arc<CoreServices>,
    pub tracker: PerformanceTracker,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    pub full: Option<String>,
    pub details: Option<String>,
    pub private: Option<String>,
}

fn is_set(flag: &Option<String>) -> bool {
    matches!(flag.as_deref(), Some("true") | Some("1"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTier {
    Minimal,
    Full,
    Private,
}

impl HealthTier {
    /// A private request without a valid token is served the full tier.
    pub fn resolve(query: &HealthQuery, token_valid: bool) -> Self {
        if is_set(&query.private) && token_valid {
            HealthTier::Private
        } else if is_set(&query.full) || is_set(&query.details) || is_set(&query.private) {
            HealthTier::Full
        } else {
            HealthTier::Minimal
        }
    }
}

#[derive(Debug, Serialize)]
struct SubsystemSummary {
    status: HealthState,
    last_check: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PrivateDetails<'a> {
    version: &'static str,
    checks: &'a BTreeMap<String, HealthRecord>,
    recent_issues: &'a [HealthIssue],
    timings: TimingSummary,
}

/// Render a snapshot for the given tier.
pub fn render_health(
    snapshot: &HealthSnapshot,
    tier: HealthTier,
    tracker: &PerformanceTracker,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "status": snapshot.status,
        "uptime": snapshot.uptime_secs,
        "timestamp": snapshot.timestamp,
    });

    match tier {
        HealthTier::Minimal => {}
        HealthTier::Full => {
            let checks: BTreeMap<&str, SubsystemSummary> = snapshot
                .checks
                .iter()
                .map(|(name, record)| {
                    (
                        name.as_str(),
                        SubsystemSummary {
                            status: record.status,
                            last_check: record.last_check,
                        },
                    )
                })
                .collect();
            body["checks"] = serde_json::json!(checks);
        }
        HealthTier::Private => {
            let details = PrivateDetails {
                version: env!("CARGO_PKG_VERSION"),
                checks: &snapshot.checks,
                recent_issues: &snapshot.recent_issues,
                timings: tracker.summary(),
            };
            if let (Some(obj), Ok(serde_json::Value::Object(extra))) =
                (body.as_object_mut(), serde_json::to_value(details))
            {
                obj.extend(extra);
            }
        }
    }

    body
}

/// Router with the health and metrics endpoints.
pub fn ops_routes(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .with_state(state)
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(HEALTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
}

async fn health_handler(
    State(state): State<OpsState>,
    Query(query): Query<HealthQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token_valid = state.health.verify_token(header_token(&headers));
    let tier = HealthTier::resolve(&query, token_valid);
    let snapshot = state.health.status();

    let code = StatusCode::from_u16(snapshot.status.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(render_health(&snapshot, tier, &state.tracker)))
}

#[derive(Debug, Serialize)]
pub struct RetryReport {
    pub service: String,
    pub stats: RetryStats,
}

#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub metrics: PoolMetrics,
    pub queries: QueryStats,
    pub counters: MonitorCounters,
}

/// Metrics of the live core components. Absent components are null.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub circuits: Option<Vec<CircuitStatus>>,
    pub retry: Vec<RetryReport>,
    pub caches: Option<Vec<CacheStats>>,
    pub pool: Option<PoolReport>,
    pub timings: TimingSummary,
}

impl MetricsReport {
    pub fn collect(state: &OpsState) -> Self {
        let services = &state.services;
        Self {
            timestamp: unix_millis(),
            uptime_secs: state.health.uptime().as_secs(),
            circuits: services.breakers().map(|r| r.statuses()),
            retry: services
                .retry_handlers()
                .iter()
                .map(|h| RetryReport {
                    service: h.service().to_string(),
                    stats: h.stats(),
                })
                .collect(),
            caches: services.cache().map(|c| c.stats()),
            pool: services.connection_monitor().map(|m| PoolReport {
                metrics: m.metrics(),
                queries: m.query_stats(),
                counters: m.counters(),
            }),
            timings: state.tracker.summary(),
        }
    }
}

async fn metrics_handler(State(state): State<OpsState>, headers: HeaderMap) -> impl IntoResponse {
    if !state.health.verify_token(header_token(&headers)) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing health token" })),
        )
            .into_response();
    }

    Json(MetricsReport::collect(&state)).into_response()
}
