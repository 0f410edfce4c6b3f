//! Storage Ports
//!
//! The storage collaborator consumed by the resilience core. Schema and
//! business rules live behind these traits.

use crate::domain::entities::{NewUser, Session, User};
use crate::domain::errors::StorageError;
use crate::domain::ports::{PoolProbe, QueryObserver};
use async_trait::async_trait;
use std::sync::Arc;

/// User persistence used by auth wiring and route handlers.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    async fn create_user(&self, user: NewUser) -> Result<User, StorageError>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Session store backing the web session middleware.
    fn session_store(&self) -> Arc<dyn SessionStore>;
}

/// Persistence for web sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, sid: &str) -> Result<Option<Session>, StorageError>;

    async fn set(&self, session: Session) -> Result<(), StorageError>;

    async fn destroy(&self, sid: &str) -> Result<(), StorageError>;

    /// Remove expired sessions. Returns the number deleted.
    async fn prune_expired(&self) -> Result<usize, StorageError>;
}

/// Connection lifecycle of a lazily connecting database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has completed yet
    Pending,
    Connected,
    /// Last connection attempt failed
    Failed(String),
    Closed,
}

/// A storage handle whose connection is established on demand.
///
/// The handle exists from the first boot phase; `connect` performs the slow
/// connect-and-validate step and is deferred to the background phase.
#[async_trait]
pub trait Database: Storage {
    async fn connect(&self) -> Result<(), StorageError>;

    fn state(&self) -> ConnectionState;

    /// The live pool, once connected.
    fn pool(&self) -> Option<Arc<dyn PoolProbe>>;

    async fn close(&self) -> Result<(), StorageError>;

    /// Report checkouts and queries to `observer`. Adapters without a pool ignore it.
    fn set_observer(&self, _observer: Arc<dyn QueryObserver>) {}
}
