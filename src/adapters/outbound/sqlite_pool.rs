//! SQLite Connection Pool
//!
//! Bounded pool of rusqlite connections with an idle queue, in-use and
//! waiting counters, and a background reaper for idle connections.

use crate::domain::errors::StorageError;
use crate::domain::ports::PoolProbe;
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Where connections point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    File(PathBuf),
    /// Named shared-cache in-memory database
    Memory(String),
}

impl SqliteTarget {
    /// Accepts `sqlite://path`, `sqlite::memory:`, `:memory:` or a bare path.
    pub fn parse(url: &str) -> Self {
        let url = url.trim();
        if url == "sqlite::memory:" || url == ":memory:" || url == "sqlite://:memory:" {
            return SqliteTarget::Memory(format!("mem-{}", uuid::Uuid::new_v4()));
        }

        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        SqliteTarget::File(PathBuf::from(path))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, SqliteTarget::Memory(_))
    }

    fn open(&self, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
        let conn = match self {
            SqliteTarget::File(path) => Connection::open(path)?,
            SqliteTarget::Memory(name) => Connection::open_with_flags(
                format!("file:{}?mode=memory&cache=shared", name),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    }
}

impl std::fmt::Display for SqliteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqliteTarget::File(path) => write!(f, "{}", path.display()),
            SqliteTarget::Memory(_) => f.write_str(":memory:"),
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    /// Maximum open connections
    pub max_connections: usize,
    /// Idle connections the reaper leaves in place
    pub min_idle: usize,
    /// Idle time before a connection is closed
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for SqlitePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_idle: 0,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

struct IdleConnection {
    conn: Connection,
    last_used: Instant,
}

/// Connection pool over a single SQLite target.
pub struct SqlitePool {
    target: SqliteTarget,
    config: SqlitePoolConfig,
    idle: Mutex<VecDeque<IdleConnection>>,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    reaper: Mutex<Option<CancellationToken>>,
}

impl SqlitePool {
    pub fn new(target: SqliteTarget, mut config: SqlitePoolConfig) -> Arc<Self> {
        config.max_connections = config.max_connections.max(1);
        config.min_idle = config.min_idle.min(config.max_connections);
        // A shared in-memory database lives only while a connection is open.
        if target.is_memory() {
            config.min_idle = config.min_idle.max(1);
        }

        Arc::new(Self {
            target,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &SqliteTarget {
        &self.target
    }

    pub fn config(&self) -> &SqlitePoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Check out a connection, opening one if none is idle.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, StorageError> {
        if self.is_closed() {
            return Err(StorageError::PoolClosed);
        }

        let permit = {
            let _waiting = CounterGuard::new(&self.waiting);
            match tokio::time::timeout(
                self.config.acquire_timeout,
                self.permits.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(StorageError::PoolClosed),
                Err(_) => return Err(StorageError::PoolTimeout(self.config.acquire_timeout)),
            }
        };

        let reused = self.idle.lock().pop_front();
        let conn = match reused {
            Some(idle) => idle.conn,
            None => {
                let target = self.target.clone();
                let busy = self.config.busy_timeout;
                tokio::task::spawn_blocking(move || target.open(busy))
                    .await?
                    .map_err(|e| StorageError::Connect(e.to_string()))?
            }
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Run `f` on a pooled connection inside the blocking thread pool.
    pub async fn with_connection<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        self.with_connection_until(&CancellationToken::new(), f).await
    }

    /// Like [`with_connection`](Self::with_connection), but interrupts the
    /// running statement when `cancel` fires or the returned future is dropped.
    ///
    /// The connection stays checked out, and counted, until `f` returns on
    /// its blocking thread, so an interrupted call never frees its slot early.
    pub async fn with_connection_until<T, F>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let pooled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Revoked),
            pooled = self.acquire() => pooled?,
        };

        let handle = pooled
            .conn
            .as_ref()
            .map(|c| c.get_interrupt_handle())
            .ok_or(StorageError::PoolClosed)?;
        let interrupt = Arc::new(Mutex::new(Some(handle)));
        let on_drop = InterruptOnDrop(interrupt.clone());

        let mut task = tokio::task::spawn_blocking(move || {
            let mut pooled = pooled;
            // Dropped first, so the handle is disarmed before checkin.
            let _disarm = Disarm(interrupt);
            match pooled.conn.as_mut() {
                Some(conn) => f(conn),
                None => Err(StorageError::PoolClosed),
            }
        });

        tokio::select! {
            joined = &mut task => joined?,
            _ = cancel.cancelled() => {
                drop(on_drop);
                Err(StorageError::Revoked)
            }
        }
    }

    /// Open connections until `min_idle` are idle.
    pub async fn warm_up(self: &Arc<Self>) -> Result<(), StorageError> {
        let mut held = Vec::new();
        while self.idle_count() + held.len() < self.config.min_idle {
            held.push(self.acquire().await?);
        }
        drop(held);
        Ok(())
    }

    fn checkin(&self, conn: Connection) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.is_closed() {
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            last_used: Instant::now(),
        });
    }

    /// Close idle connections past `idle_timeout`, keeping `min_idle`.
    pub fn reap_idle(&self) -> usize {
        let mut idle = self.idle.lock();
        let mut removed = 0;

        while idle.len() > self.config.min_idle {
            // Oldest checkins sit at the front.
            match idle.front() {
                Some(c) if c.last_used.elapsed() > self.config.idle_timeout => {
                    idle.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }

        if removed > 0 {
            tracing::debug!(
                category = "pool",
                "pool cleanup for {}: removed {} idle connections",
                self.target,
                removed
            );
        }
        removed
    }

    /// Start periodic idle reaping.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *reaper = Some(cancel.clone());
        let pool = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.reap_idle();
                    }
                }
            }
        });
    }

    /// Close the pool: pending and future acquires fail, idle connections close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        self.idle.lock().clear();
        if let Some(cancel) = self.reaper.lock().take() {
            cancel.cancel();
        }
        tracing::info!(category = "pool", "closed pool for {}", self.target);
    }
}

impl PoolProbe for SqlitePool {
    fn total_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst) + self.idle.lock().len()
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn max_size(&self) -> usize {
        self.config.max_connections
    }

    fn active_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        if let Some(cancel) = self.reaper.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<SqlitePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

struct Disarm(Arc<Mutex<Option<InterruptHandle>>>);

impl Drop for Disarm {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// Interrupts the statement on its connection unless disarmed first.
struct InterruptOnDrop(Arc<Mutex<Option<InterruptHandle>>>);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.lock().as_ref() {
            handle.interrupt();
        }
    }
}

struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
