//! Pool Probe Port
//!
//! Read-only view of a resource pool used by the connection monitor, and
//! the observer a storage adapter reports checkouts to.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts exposed by a connection pool.
///
/// Each concrete pool implements this explicitly so the monitor never has to
/// guess at the pool's shape.
pub trait PoolProbe: Send + Sync {
    /// Connections currently open (checked out + idle).
    fn total_count(&self) -> usize;

    /// Open connections sitting idle in the pool.
    fn idle_count(&self) -> usize;

    /// Callers blocked waiting for a connection.
    fn waiting_count(&self) -> usize {
        0
    }

    /// Configured upper bound on open connections.
    fn max_size(&self) -> usize;

    /// Connections currently checked out.
    fn active_count(&self) -> usize {
        self.total_count().saturating_sub(self.idle_count())
    }
}

/// Receives connection checkout and query events from a storage adapter.
pub trait QueryObserver: Send + Sync {
    /// Record a checkout. Returns its id and a token that is cancelled if the
    /// observer revokes the checkout.
    fn connection_acquired(&self, context: &str) -> (String, CancellationToken);

    fn connection_released(&self, id: &str);

    fn query_completed(&self, query: &str, duration: Duration, success: bool);
}
