//! Swappable Application Router
//!
//! The listener is bound before routes are registered. It serves an
//! `AppRouter`, which forwards each request to whichever router was
//! installed last.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

#[derive(Default)]
struct Inner {
    current: RwLock<Option<Router>>,
    draining: AtomicBool,
}

/// Router handle shared by the listener and the bootstrapper.
#[derive(Clone, Default)]
pub struct AppRouter {
    inner: Arc<Inner>,
}

impl AppRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the routes served from now on.
    pub fn install(&self, router: Router) {
        *self.inner.current.write() = Some(router);
    }

    pub fn is_installed(&self) -> bool {
        self.inner.current.read().is_some()
    }

    /// Refuse new requests with 503.
    pub fn begin_draining(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            tracing::info!(category = "http", "no longer accepting requests");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// The router handed to `axum::serve`.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }
}

async fn dispatch(State(app): State<AppRouter>, req: Request) -> Response {
    if app.is_draining() {
        return unavailable("shutting down");
    }

    let router = app.inner.current.read().clone();
    match router {
        Some(router) => match router.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        },
        None => unavailable("starting up"),
    }
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "status": "unavailable", "reason": reason })),
    )
        .into_response()
}

/// Fallback while only essential routes are installed.
pub async fn starting_up() -> Response {
    unavailable("starting up")
}

/// Fallback once application routes are installed.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
        .into_response()
}
