mod api_routes;
mod app_router;
mod health_api;
mod sessions;

pub use api_routes::{ApiRoutes, UserView, SESSION_USER_KEY};
pub use app_router::{not_found, starting_up, AppRouter};
pub use health_api::{ops_routes, OpsState, HEALTH_TOKEN_HEADER};
pub use sessions::{SessionConfig, SessionHandle, SESSION_COOKIE};

// Re-export for external use (e.g., integration tests)
#[allow(unused_imports)]
pub use health_api::{render_health, HealthQuery, HealthTier, MetricsReport, PoolReport, RetryReport};
#[allow(unused_imports)]
pub use sessions::{sign, SESSION_TTL};
