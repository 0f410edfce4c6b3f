//! SQLite Database
//!
//! Implements the `Database` port over a [`SqlitePool`]. The handle is
//! created immediately and connects on `connect()` or on first use.

use super::sqlite_pool::{SqlitePool, SqlitePoolConfig, SqliteTarget};
use crate::domain::entities::{unix_millis, NewUser, Session, User};
use crate::domain::errors::StorageError;
use crate::domain::ports::{ConnectionState, Database, PoolProbe, QueryObserver, SessionStore, Storage};
use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    email TEXT,
    role TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    sid TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

struct Shared {
    target: SqliteTarget,
    pool_config: SqlitePoolConfig,
    pool: RwLock<Option<Arc<SqlitePool>>>,
    state: RwLock<ConnectionState>,
    observer: RwLock<Option<Arc<dyn QueryObserver>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn connect(&self) -> Result<Arc<SqlitePool>, StorageError> {
        let _guard = self.connecting.lock().await;

        if let Some(pool) = self.pool.read().clone() {
            return Ok(pool);
        }
        if *self.state.read() == ConnectionState::Closed {
            return Err(StorageError::NotConnected);
        }

        let started = Instant::now();
        tracing::info!(category = "database", "connecting to {}", self.target);

        let pool = SqlitePool::new(self.target.clone(), self.pool_config.clone());
        let validated = async {
            pool.warm_up().await?;
            pool.with_connection(|conn| {
                conn.execute_batch(SCHEMA)?;
                conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
                Ok(())
            })
            .await
        }
        .await;

        match validated {
            Ok(()) => {
                pool.start_reaper(self.pool_config.idle_timeout.max(Duration::from_secs(1)));
                *self.pool.write() = Some(pool.clone());
                *self.state.write() = ConnectionState::Connected;
                tracing::info!(
                    category = "database",
                    "connected to {} in {}ms",
                    self.target,
                    started.elapsed().as_millis()
                );
                Ok(pool)
            }
            Err(e) => {
                pool.close();
                let reason = e.to_string();
                tracing::error!(category = "database", "connection to {} failed: {}", self.target, reason);
                *self.state.write() = ConnectionState::Failed(reason.clone());
                Err(StorageError::Connect(reason))
            }
        }
    }

    async fn pool(&self) -> Result<Arc<SqlitePool>, StorageError> {
        match self.pool.read().clone() {
            Some(pool) => return Ok(pool),
            None if *self.state.read() == ConnectionState::Closed => {
                return Err(StorageError::NotConnected)
            }
            None => {}
        }
        self.connect().await
    }

    /// Run a query, reporting the checkout and its timing to the observer.
    async fn run<T, F>(&self, label: &'static str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool().await?;
        let observer = self.observer.read().clone();
        let started = Instant::now();

        let result = match &observer {
            Some(observer) => {
                let (id, revoked) = observer.connection_acquired(label);
                let result = pool.with_connection_until(&revoked, f).await;
                observer.connection_released(&id);
                result
            }
            None => pool.with_connection(f).await,
        };

        if let Some(observer) = &observer {
            observer.query_completed(label, started.elapsed(), result.is_ok());
        }
        result
    }
}

/// Lazily connecting SQLite database.
pub struct SqliteDatabase {
    shared: Arc<Shared>,
    sessions: Arc<SqliteSessionStore>,
}

impl SqliteDatabase {
    pub fn new(url: &str, pool_config: SqlitePoolConfig) -> Self {
        let shared = Arc::new(Shared {
            target: SqliteTarget::parse(url),
            pool_config,
            pool: RwLock::new(None),
            state: RwLock::new(ConnectionState::Pending),
            observer: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
        });
        Self {
            sessions: Arc::new(SqliteSessionStore {
                shared: shared.clone(),
            }),
            shared,
        }
    }

    /// Pool settings derived from the `DB_POOL_*` and `ULTRA_MINIMAL_DB` settings.
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        let url = cfg
            .database_url
            .clone()
            .unwrap_or_else(|| "sqlite::memory:".to_string());

        Self::new(
            &url,
            SqlitePoolConfig {
                max_connections: cfg.pool_max(),
                min_idle: cfg.pool_min(),
                idle_timeout: cfg.db_idle_timeout(),
                ..Default::default()
            },
        )
    }

    pub fn target(&self) -> &SqliteTarget {
        &self.shared.target
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        email: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get::<_, i64>(5)? as u64,
    })
}

const USER_COLUMNS: &str = "id, username, password_hash, email, role, created_at";

#[async_trait]
impl Storage for SqliteDatabase {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError> {
        self.shared
            .run("SELECT users by id", move |conn| {
                let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
                Ok(conn.query_row(&sql, params![id], row_to_user).optional()?)
            })
            .await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let username = username.to_string();
        self.shared
            .run("SELECT users by username", move |conn| {
                let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
                Ok(conn.query_row(&sql, params![username], row_to_user).optional()?)
            })
            .await
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        self.shared
            .run("INSERT INTO users", move |conn| {
                let created_at = unix_millis();
                let inserted = conn.execute(
                    "INSERT INTO users (username, password_hash, email, role, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        user.username,
                        user.password_hash,
                        user.email,
                        user.role,
                        created_at as i64
                    ],
                );

                match inserted {
                    Ok(_) => Ok(User {
                        id: conn.last_insert_rowid(),
                        username: user.username,
                        password_hash: user.password_hash,
                        email: user.email,
                        role: user.role,
                        created_at,
                    }),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(StorageError::Conflict(user.username))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.shared
            .run("SELECT 1", |conn| {
                conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
                Ok(())
            })
            .await
    }

    fn session_store(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn connect(&self) -> Result<(), StorageError> {
        self.shared.connect().await.map(|_| ())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    fn pool(&self) -> Option<Arc<dyn PoolProbe>> {
        self.shared
            .pool
            .read()
            .clone()
            .map(|p| p as Arc<dyn PoolProbe>)
    }

    async fn close(&self) -> Result<(), StorageError> {
        let _guard = self.shared.connecting.lock().await;
        *self.shared.state.write() = ConnectionState::Closed;
        if let Some(pool) = self.shared.pool.write().take() {
            pool.close();
        }
        tracing::info!(category = "database", "database closed");
        Ok(())
    }

    fn set_observer(&self, observer: Arc<dyn QueryObserver>) {
        *self.shared.observer.write() = Some(observer);
    }
}

/// Session store sharing the database's pool.
pub struct SqliteSessionStore {
    shared: Arc<Shared>,
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, sid: &str) -> Result<Option<Session>, StorageError> {
        let sid = sid.to_string();
        self.shared
            .run("SELECT sessions", move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT data, expires_at FROM sessions WHERE sid = ?1",
                        params![sid],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;

                let Some((data, expires_at)) = row else {
                    return Ok(None);
                };
                if expires_at as u64 <= unix_millis() {
                    conn.execute("DELETE FROM sessions WHERE sid = ?1", params![sid])?;
                    return Ok(None);
                }

                Ok(Some(Session {
                    sid,
                    data: serde_json::from_str(&data)?,
                    expires_at: expires_at as u64,
                }))
            })
            .await
    }

    async fn set(&self, session: Session) -> Result<(), StorageError> {
        self.shared
            .run("UPSERT sessions", move |conn| {
                let data = serde_json::to_string(&session.data)?;
                conn.execute(
                    "INSERT INTO sessions (sid, data, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(sid) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
                    params![session.sid, data, session.expires_at as i64],
                )?;
                Ok(())
            })
            .await
    }

    async fn destroy(&self, sid: &str) -> Result<(), StorageError> {
        let sid = sid.to_string();
        self.shared
            .run("DELETE FROM sessions", move |conn| {
                conn.execute("DELETE FROM sessions WHERE sid = ?1", params![sid])?;
                Ok(())
            })
            .await
    }

    async fn prune_expired(&self) -> Result<usize, StorageError> {
        let now = unix_millis() as i64;
        self.shared
            .run("DELETE FROM sessions (expired)", move |conn| {
                Ok(conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?)
            })
            .await
    }
}
