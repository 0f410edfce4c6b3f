//! Error Taxonomy
//!
//! Errors surfaced by the resilience primitives and storage collaborators.
//! Library-level components (circuit breaker, retry) return these to callers;
//! infrastructure components log them and keep running.

use std::time::Duration;

/// Failure reported by a guarded operation.
///
/// Carries the pieces retry classification looks at: an optional HTTP
/// status, an optional transport error code (`ECONNRESET`, ...) and the
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// Attach an HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a transport error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Some("ECONNRESET"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::BrokenPipe => Some("EPIPE"),
            ErrorKind::AddrNotAvailable => Some("ENOTFOUND"),
            _ => None,
        };

        let err = OperationError::new(e.to_string());
        match code {
            Some(c) => err.with_code(c),
            None => err,
        }
    }
}

impl From<reqwest::Error> for OperationError {
    fn from(e: reqwest::Error) -> Self {
        let mut err = OperationError::new(e.to_string());
        if let Some(status) = e.status() {
            err = err.with_status(status.as_u16());
        }
        if e.is_timeout() {
            err = err.with_code("ETIMEDOUT");
        } else if e.is_connect() {
            err = err.with_code("ECONNREFUSED");
        }
        err
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<OperationError>() {
            Ok(op) => op,
            Err(e) => OperationError::new(format!("{:#}", e)),
        }
    }
}

/// Errors surfaced by the circuit breaker and retry handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResilienceError {
    /// Dependency presumed down; the call was not attempted.
    #[error("circuit breaker for {service} is open")]
    CircuitOpen { service: String },

    /// The operation exceeded its time budget and was cancelled.
    #[error("{service} operation timed out after {}ms", timeout.as_millis())]
    Timeout { service: String, timeout: Duration },

    /// Every retry attempt failed.
    #[error("{service} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        service: String,
        attempts: u32,
        #[source]
        last: Box<ResilienceError>,
    },

    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl ResilienceError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    /// The innermost error, unwrapping retry exhaustion.
    pub fn root(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for ResilienceError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<ResilienceError>() {
            Ok(re) => re,
            Err(e) => ResilienceError::Operation(OperationError::from(e)),
        }
    }
}

impl From<StorageError> for ResilienceError {
    fn from(e: StorageError) -> Self {
        ResilienceError::Operation(e.into())
    }
}

/// Storage collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database is not connected")]
    NotConnected,
    #[error("database connection failed: {0}")]
    Connect(String),
    #[error("connection pool closed")]
    PoolClosed,
    #[error("connection pool exhausted after waiting {}ms", .0.as_millis())]
    PoolTimeout(Duration),
    #[error("connection revoked by the pool monitor")]
    Revoked,
    #[error("username already taken: {0}")]
    Conflict(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StorageError> for OperationError {
    fn from(e: StorageError) -> Self {
        let err = OperationError::new(e.to_string());
        match e {
            StorageError::NotConnected | StorageError::Connect(_) => err.with_code("ECONNREFUSED"),
            StorageError::PoolTimeout(_) => err.with_code("ETIMEDOUT"),
            _ => err,
        }
    }
}

/// A boot sub-step failed; the step's handle stays absent.
#[derive(Debug, thiserror::Error)]
#[error("failed to initialize {component}: {reason}")]
pub struct InitializationError {
    pub component: &'static str,
    pub reason: String,
}

impl InitializationError {
    pub fn new(component: &'static str, reason: impl std::fmt::Display) -> Self {
        Self {
            component,
            reason: reason.to_string(),
        }
    }
}
