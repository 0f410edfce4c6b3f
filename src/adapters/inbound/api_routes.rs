//! Default Application Routes
//!
//! Registrar used by the binary: a version endpoint available from the core
//! phase, cookie sessions, and user routes backed by the storage
//! collaborator. Reads go through the user cache and the storage retry
//! handler once those exist.

use super::sessions::{SessionConfig, SessionHandle};
use crate::application::{CoreServices, STORAGE_RETRY};
use crate::domain::entities::{NewUser, User};
use crate::domain::errors::{ResilienceError, StorageError};
use crate::domain::ports::{RouteRegistrar, Storage};
use crate::infrastructure::{Cache, CacheType};
use async_trait::async_trait;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session key holding the signed-in user's id.
pub const SESSION_USER_KEY: &str = "user_id";

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub created_at: u64,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Default)]
pub struct ApiRoutes {
    services: Option<Arc<CoreServices>>,
    /// Set by `register_auth`; routes registered afterwards are wrapped in it
    sessions: RwLock<Option<SessionConfig>>,
}

impl ApiRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the cache and retry handlers from `services` as they come up.
    pub fn with_services(services: Arc<CoreServices>) -> Self {
        Self {
            services: Some(services),
            ..Default::default()
        }
    }

    fn with_sessions(&self, router: Router) -> Router {
        match self.sessions.read().as_ref() {
            Some(sessions) => sessions.layer(router),
            None => router,
        }
    }
}

#[derive(Clone)]
struct ApiState {
    storage: Arc<dyn Storage>,
    services: Option<Arc<CoreServices>>,
}

impl ApiState {
    fn user_cache(&self) -> Option<Arc<Cache>> {
        self.services
            .as_ref()
            .and_then(|s| s.cache())
            .map(|c| c.cache(CacheType::User))
    }

    async fn load_user(&self, id: i64) -> Result<Option<User>, ResilienceError> {
        let retry = self
            .services
            .as_ref()
            .and_then(|s| s.retry_handler(STORAGE_RETRY));

        match retry {
            Some(retry) => {
                let storage = self.storage.clone();
                retry
                    .retry(move |cancel| {
                        let storage = storage.clone();
                        async move {
                            // Dropping the lookup interrupts it on its connection.
                            tokio::select! {
                                found = storage.get_user(id) => found,
                                _ = cancel.cancelled() => Err(StorageError::Revoked),
                            }
                        }
                    })
                    .await
            }
            None => self.storage.get_user(id).await.map_err(ResilienceError::from),
        }
    }
}

fn user_key(id: i64) -> String {
    format!("user:{}", id)
}

#[async_trait]
impl RouteRegistrar for ApiRoutes {
    async fn register_essential_routes(&self, router: Router) -> anyhow::Result<Router> {
        Ok(router.route("/api/version", get(version_handler)))
    }

    async fn register_auth(
        &self,
        router: Router,
        storage: Arc<dyn Storage>,
        session_secret: &str,
    ) -> anyhow::Result<Router> {
        if session_secret.is_empty() {
            anyhow::bail!("session secret is empty");
        }
        let sessions = SessionConfig::new(storage.session_store(), session_secret);
        *self.sessions.write() = Some(sessions);

        let auth = Router::new().route(
            "/api/session",
            get(session_handler).delete(logout_handler),
        );
        Ok(router.merge(self.with_sessions(auth)))
    }

    async fn register_routes(&self, router: Router, storage: Arc<dyn Storage>) -> anyhow::Result<Router> {
        let state = ApiState {
            storage,
            services: self.services.clone(),
        };

        let api = Router::new()
            .route("/api/users", post(create_user_handler))
            .route("/api/users/:id", get(get_user_handler))
            .with_state(state);

        Ok(router.merge(self.with_sessions(api)))
    }
}

async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

/// Map a storage failure to a response. Unreachable dependencies are 503.
fn resilience_error_response(err: &ResilienceError) -> Response {
    let status = match err.root() {
        ResilienceError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ResilienceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ResilienceError::Operation(op) if op.code.is_some() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!(category = "http", "storage request failed: {}", err);
    error_body(status, err)
}

fn storage_error_response(err: &StorageError) -> Response {
    let status = match err {
        StorageError::Conflict(_) => StatusCode::CONFLICT,
        StorageError::NotConnected
        | StorageError::Connect(_)
        | StorageError::PoolClosed
        | StorageError::PoolTimeout(_)
        | StorageError::Revoked => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status != StatusCode::CONFLICT {
        tracing::error!(category = "http", "storage request failed: {}", err);
    }
    error_body(status, err)
}

async fn get_user_handler(State(state): State<ApiState>, Path(id): Path<i64>) -> Response {
    let cache = state.user_cache();
    let key = user_key(id);

    if let Some(user) = cache.as_ref().and_then(|c| c.get_as::<UserView>(&key)) {
        return Json(user).into_response();
    }

    match state.load_user(id).await {
        Ok(Some(user)) => {
            let view = UserView::from(user);
            if let Some(cache) = &cache {
                if let Err(e) = cache.set_as(&key, &view, None) {
                    tracing::warn!(category = "cache", "failed to cache {}: {}", key, e);
                }
            }
            Json(view).into_response()
        }
        Ok(None) => error_body(StatusCode::NOT_FOUND, "user not found"),
        Err(e) => resilience_error_response(&e),
    }
}

async fn session_handler(Extension(session): Extension<SessionHandle>) -> Response {
    if session.get(SESSION_USER_KEY).is_none() {
        return error_body(StatusCode::UNAUTHORIZED, "not signed in");
    }
    Json(session.data()).into_response()
}

async fn logout_handler(Extension(session): Extension<SessionHandle>) -> StatusCode {
    session.destroy();
    StatusCode::NO_CONTENT
}

/// Creating an account signs the caller in when sessions are wired.
async fn create_user_handler(
    State(state): State<ApiState>,
    session: Option<Extension<SessionHandle>>,
    Json(user): Json<NewUser>,
) -> Response {
    if user.username.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "username is required");
    }

    match state.storage.create_user(user).await {
        Ok(user) => {
            let view = UserView::from(user);
            tracing::info!(category = "http", "created user {}", view.id);
            if let Some(Extension(session)) = session {
                session.insert(SESSION_USER_KEY, view.id);
            }
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(e) => storage_error_response(&e),
    }
}
