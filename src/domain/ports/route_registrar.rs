//! Route Registrar Port
//!
//! The HTTP route collaborator invoked once during the core boot phase.

use crate::domain::ports::Storage;
use async_trait::async_trait;
use axum::Router;
use std::sync::Arc;

/// Registers application routes onto the router served by the listener.
///
/// Each method receives the router built so far and returns it extended.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Routes that must be available as soon as the core phase runs.
    async fn register_essential_routes(&self, router: Router) -> anyhow::Result<Router> {
        Ok(router)
    }

    /// Session and authentication wiring.
    async fn register_auth(
        &self,
        router: Router,
        _storage: Arc<dyn Storage>,
        _session_secret: &str,
    ) -> anyhow::Result<Router> {
        Ok(router)
    }

    /// The remaining application routes.
    async fn register_routes(&self, router: Router, storage: Arc<dyn Storage>) -> anyhow::Result<Router>;
}
