//! Circuit Breaker Pattern
//!
//! Isolates failing dependencies: after enough consecutive failures calls are
//! rejected (or routed to a fallback) until a reset timeout elapses, then a
//! single probe decides whether the circuit closes again.

use crate::domain::entities::unix_millis;
use crate::domain::errors::ResilienceError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Async probe used to attempt early recovery while the circuit is open.
pub type RecoveryProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Fallback type used when no fallback is supplied.
type NoFallback<T> = fn(ResilienceError) -> std::future::Ready<Result<T, ResilienceError>>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub reset_timeout: Duration,
    /// Budget for a single guarded call
    pub timeout_duration: Duration,
    /// Optional health check tried when a call is rejected
    pub recovery_probe: Option<RecoveryProbe>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            timeout_duration: Duration::from_secs(10),
            recovery_probe: None,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("timeout_duration", &self.timeout_duration)
            .field("recovery_probe", &self.recovery_probe.is_some())
            .finish()
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    #[default]
    Closed,
    /// Circuit tripped - requests blocked
    Open,
    /// Testing recovery - one probe allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Call counters for one circuit.
#[derive(Debug, Default)]
struct StatCounters {
    success: AtomicU64,
    failure: AtomicU64,
    timeout: AtomicU64,
    rejected: AtomicU64,
    fallback: AtomicU64,
    total_calls: AtomicU64,
    opened: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> CircuitStats {
        CircuitStats {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            times_opened: self.opened.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        for counter in [
            &self.success,
            &self.failure,
            &self.timeout,
            &self.rejected,
            &self.fallback,
            &self.total_calls,
            &self.opened,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub rejected: u64,
    pub fallback: u64,
    pub total_calls: u64,
    pub times_opened: u64,
}

/// Point-in-time view of a circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    /// Unix milliseconds
    pub last_failure_time: Option<u64>,
    /// Unix milliseconds
    pub last_success_time: Option<u64>,
    /// Milliseconds until a probe is allowed (open circuits only)
    pub next_attempt_in_ms: Option<u64>,
    pub stats: CircuitStats,
}

/// Mutable circuit state, guarded by one lock.
#[derive(Debug, Default)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<u64>,
    last_success: Option<u64>,
    next_attempt: Option<Instant>,
    /// Bumped on every open/close so stale timers and probes become no-ops
    generation: u64,
    probe_in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    stats: StatCounters,
}

impl Shared {
    fn trip(self: &Arc<Self>, inner: &mut CircuitInner) {
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        inner.generation += 1;
        inner.probe_in_flight = false;
        self.stats.opened.fetch_add(1, Ordering::Relaxed);

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        // Without a runtime the lazy transition in `admit` still applies.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(self);
            let generation = inner.generation;
            let delay = self.config.reset_timeout;
            inner.timer = Some(handle.spawn(async move {
                tokio::time::sleep(delay).await;
                let mut inner = shared.inner.lock();
                if inner.generation == generation && inner.state == CircuitState::Open {
                    Self::enter_half_open(&shared.name, &mut inner);
                }
            }));
        }
    }

    fn enter_half_open(name: &str, inner: &mut CircuitInner) {
        inner.state = CircuitState::HalfOpen;
        inner.next_attempt = None;
        inner.probe_in_flight = false;
        tracing::info!(category = "circuit", "circuit breaker for {} transitioning to half-open", name);
    }

    fn close(&self, inner: &mut CircuitInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt = None;
        inner.generation += 1;
        inner.probe_in_flight = false;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}

/// How a call was admitted.
enum Admission {
    Call,
    /// Half-open probe, tagged with the generation it belongs to
    Probe(u64),
    Rejected,
}

/// Clears the probe slot if the probe is abandoned before it reports back.
struct ProbeGuard {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == self.generation {
            inner.probe_in_flight = false;
        }
    }
}

/// Circuit breaker for one dependency.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a standalone circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                inner: Mutex::new(CircuitInner::default()),
                stats: StatCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CircuitState {
        self.shared.inner.lock().state
    }

    /// Run `op` through the breaker.
    ///
    /// The operation receives a token that is cancelled if it exceeds
    /// `timeout_duration`; its future is dropped at that point.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.call(op, None::<NoFallback<T>>).await
    }

    /// Run `op` through the breaker, routing rejections and failures to `fallback`.
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FBFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
        FB: FnOnce(ResilienceError) -> FBFut,
        FBFut: Future<Output = Result<T, ResilienceError>>,
    {
        self.call(op, Some(fallback)).await
    }

    async fn call<T, E, F, Fut, FB, FBFut>(
        &self,
        op: F,
        fallback: Option<FB>,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
        FB: FnOnce(ResilienceError) -> FBFut,
        FBFut: Future<Output = Result<T, ResilienceError>>,
    {
        self.shared.stats.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut admission = self.admit();
        if matches!(admission, Admission::Rejected) {
            admission = self.attempt_early_recovery().await;
        }

        let guard = match admission {
            Admission::Rejected => {
                self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(category = "circuit", "circuit breaker for {} rejected call", self.name());
                let err = ResilienceError::CircuitOpen {
                    service: self.shared.name.clone(),
                };
                return self.fall_back(err, fallback).await;
            }
            Admission::Call => None,
            Admission::Probe(generation) => Some(ProbeGuard {
                shared: Arc::clone(&self.shared),
                generation,
            }),
        };
        let is_probe = guard.is_some();

        let result = self.run(op).await;
        let outcome = match result {
            Ok(value) => {
                self.record_success(is_probe);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err, is_probe);
                Err(err)
            }
        };
        drop(guard);

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => self.fall_back(err, fallback).await,
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Call,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe(inner.generation)
                }
            }
            CircuitState::Open => {
                if recovery_due(inner.next_attempt, Instant::now()) {
                    Shared::enter_half_open(&self.shared.name, &mut inner);
                    inner.probe_in_flight = true;
                    Admission::Probe(inner.generation)
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    async fn attempt_early_recovery(&self) -> Admission {
        let Some(probe) = self.shared.config.recovery_probe.clone() else {
            return Admission::Rejected;
        };
        if self.state() != CircuitState::Open {
            return Admission::Rejected;
        }

        let healthy = tokio::time::timeout(self.shared.config.timeout_duration, probe())
            .await
            .unwrap_or(false);
        if !healthy {
            return Admission::Rejected;
        }

        let mut inner = self.shared.inner.lock();
        if inner.state == CircuitState::Open {
            tracing::info!(
                category = "circuit",
                "health check passed for {}, attempting early recovery",
                self.shared.name
            );
            Shared::enter_half_open(&self.shared.name, &mut inner);
        }
        if inner.state == CircuitState::HalfOpen && !inner.probe_in_flight {
            inner.probe_in_flight = true;
            Admission::Probe(inner.generation)
        } else {
            Admission::Rejected
        }
    }

    async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let token = CancellationToken::new();
        let timeout = self.shared.config.timeout_duration;

        match tokio::time::timeout(timeout, op(token.clone())).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                token.cancel();
                Err(ResilienceError::Timeout {
                    service: self.shared.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn record_success(&self, is_probe: bool) {
        self.shared.stats.success.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.shared.inner.lock();
        inner.last_success = Some(unix_millis());

        // The state may have moved while the call was in flight.
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if is_probe => {
                self.shared.close(&mut inner);
                tracing::info!(category = "circuit", "circuit breaker for {} closed (recovered)", self.shared.name);
            }
            _ => {}
        }
    }

    fn record_failure(&self, err: &ResilienceError, is_probe: bool) {
        let stats = &self.shared.stats;
        stats.failure.fetch_add(1, Ordering::Relaxed);
        if err.is_timeout() {
            stats.timeout.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.shared.inner.lock();
        inner.last_failure = Some(unix_millis());

        match inner.state {
            CircuitState::HalfOpen if is_probe => {
                self.shared.trip(&mut inner);
                tracing::warn!(
                    category = "circuit",
                    "circuit breaker for {} re-opened (failed in half-open): {}",
                    self.shared.name,
                    err
                );
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.shared.config.failure_threshold {
                    self.shared.trip(&mut inner);
                    tracing::warn!(
                        category = "circuit",
                        "circuit breaker for {} opened after {} failures",
                        self.shared.name,
                        inner.failure_count
                    );
                }
            }
            _ => {}
        }
    }

    async fn fall_back<T, FB, FBFut>(
        &self,
        err: ResilienceError,
        fallback: Option<FB>,
    ) -> Result<T, ResilienceError>
    where
        FB: FnOnce(ResilienceError) -> FBFut,
        FBFut: Future<Output = Result<T, ResilienceError>>,
    {
        match fallback {
            Some(fb) => {
                self.shared.stats.fallback.fetch_add(1, Ordering::Relaxed);
                fb(err).await
            }
            None => Err(err),
        }
    }

    /// Force the circuit open.
    pub fn open(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.trip(&mut inner);
        tracing::warn!(category = "circuit", "circuit breaker for {} manually opened", self.shared.name);
    }

    /// Force the circuit closed. Accumulated stats are kept.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.close(&mut inner);
        tracing::info!(category = "circuit", "circuit breaker for {} manually closed", self.shared.name);
    }

    /// Clear state, timers and stats.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.close(&mut inner);
        inner.last_failure = None;
        inner.last_success = None;
        self.shared.stats.clear();
        tracing::info!(category = "circuit", "circuit breaker for {} reset", self.shared.name);
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.shared.inner.lock();
        let now = Instant::now();
        CircuitStatus {
            name: self.shared.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.shared.config.failure_threshold,
            last_failure_time: inner.last_failure,
            last_success_time: inner.last_success,
            next_attempt_in_ms: inner
                .next_attempt
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            stats: self.shared.stats.snapshot(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the circuit breakers of one process.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Get or create a breaker with the registry defaults.
    pub fn get_or_create(&self, service: &str) -> CircuitBreaker {
        self.get_or_create_with(service, self.defaults.clone())
    }

    /// Get or create a breaker; `config` only applies on creation.
    pub fn get_or_create_with(&self, service: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::debug!(category = "circuit", "registered circuit breaker for {}", service);
                CircuitBreaker::new(service, config)
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<CircuitBreaker> {
        self.breakers.get(service).map(|b| b.clone())
    }

    /// Status of every circuit, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let mut statuses: Vec<CircuitStatus> =
            self.breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of circuits currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// An open circuit admits a probe only once `next_attempt` has passed.
fn recovery_due(next_attempt: Option<Instant>, now: Instant) -> bool {
    next_attempt.map(|at| now > at).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::OperationError;
    use std::sync::atomic::AtomicU32;

    fn config(threshold: u32, reset: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
            timeout_duration: Duration::from_millis(200),
            recovery_probe: None,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), ResilienceError> {
        cb.execute(|_| async { Err::<(), _>(OperationError::new("boom")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, ResilienceError> {
        cb.execute(|_| async { Ok::<_, OperationError>(7) }).await
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
        assert_eq!(CircuitState::default(), CircuitState::Closed);
    }

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_duration, Duration::from_secs(10));
        assert!(format!("{:?}", config).contains("recovery_probe: false"));
    }

    #[test]
    fn test_recovery_due_only_after_next_attempt() {
        let at = Instant::now();
        assert!(!recovery_due(Some(at), at));
        assert!(!recovery_due(Some(at + Duration::from_millis(5)), at));
        assert!(recovery_due(Some(at), at + Duration::from_nanos(1)));
        assert!(recovery_due(None, at));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = CircuitBreaker::new("db", config(3, Duration::from_secs(60)));
        assert_eq!(succeed(&cb).await.unwrap(), 7);

        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.stats.success, 1);
        assert_eq!(status.stats.total_calls, 1);
        assert!(status.last_success_time.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("db", config(5, Duration::from_secs(60)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.status().failure_count, 2);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.status().failure_count, 0);
    }

    #[tokio::test]
    async fn test_opens_exactly_once_and_rejects() {
        let cb = CircuitBreaker::new("db", config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            let err = fail(&cb).await.unwrap_err();
            assert!(!err.is_circuit_open());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        for _ in 0..5 {
            let err = fail(&cb).await.unwrap_err();
            assert!(err.is_circuit_open());
        }

        let status = cb.status();
        assert_eq!(status.stats.times_opened, 1);
        assert_eq!(status.stats.rejected, 5);
        assert_eq!(status.stats.failure, 3);
        assert!(status.next_attempt_in_ms.is_some());
    }

    #[tokio::test]
    async fn test_rejected_call_does_not_run_operation() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_secs(60)));
        let _ = fail(&cb).await;

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = cb
            .execute(move |_| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(())
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_open_circuit() {
        let cb = CircuitBreaker::new("api", config(1, Duration::from_secs(60)));
        let _ = fail(&cb).await;

        let value = cb
            .execute_with_fallback(
                |_| async { Ok::<_, OperationError>("live") },
                |err| async move {
                    assert!(err.is_circuit_open());
                    Ok("cached")
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "cached");
        assert_eq!(cb.status().stats.fallback, 1);
    }

    #[tokio::test]
    async fn test_fallback_on_failure() {
        let cb = CircuitBreaker::new("api", config(5, Duration::from_secs(60)));
        let value = cb
            .execute_with_fallback(
                |_| async { Err::<u32, _>(OperationError::new("down")) },
                |_| async { Ok(0) },
            )
            .await
            .unwrap();
        assert_eq!(value, 0);
        assert_eq!(cb.status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new("db", config(2, Duration::from_millis(20)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        succeed(&cb).await.unwrap();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new("db", config(3, Duration::from_millis(20)));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = fail(&cb).await.unwrap_err();
        assert!(!err.is_circuit_open());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().stats.times_opened, 2);
    }

    #[tokio::test]
    async fn test_timer_moves_to_half_open() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_millis(20)));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_millis(10)));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|_| async move {
                    let _ = release_rx.await;
                    Ok::<_, OperationError>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = succeed(&cb).await;
        assert!(second.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_and_cancels() {
        let cb = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                timeout_duration: Duration::from_millis(20),
                ..config(5, Duration::from_secs(60))
            },
        );

        let observed = Arc::new(tokio::sync::Notify::new());
        let seen = observed.clone();
        let err = cb
            .execute(move |token: CancellationToken| {
                tokio::spawn(async move {
                    token.cancelled().await;
                    seen.notify_one();
                });
                async { std::future::pending::<Result<(), OperationError>>().await }
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        tokio::time::timeout(Duration::from_secs(1), observed.notified())
            .await
            .expect("operation should observe cancellation");

        let stats = cb.status().stats;
        assert_eq!(stats.timeout, 1);
        assert_eq!(stats.failure, 1);
    }

    #[tokio::test]
    async fn test_recovery_probe_allows_early_call() {
        let probe: RecoveryProbe = Arc::new(|| Box::pin(async { true }));
        let cb = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                recovery_probe: Some(probe),
                ..config(1, Duration::from_secs(60))
            },
        );
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failing_recovery_probe_keeps_open() {
        let probe: RecoveryProbe = Arc::new(|| Box::pin(async { false }));
        let cb = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                recovery_probe: Some(probe),
                ..config(1, Duration::from_secs(60))
            },
        );
        let _ = fail(&cb).await;
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
        assert_eq!(cb.status().stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_close_keeps_stats_reset_clears() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_secs(60)));
        let _ = fail(&cb).await;

        cb.close();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.stats.failure, 1);

        cb.reset();
        let status = cb.status();
        assert_eq!(status.stats, CircuitStats::default());
        assert!(status.last_failure_time.is_none());
    }

    #[tokio::test]
    async fn test_manual_open() {
        let cb = CircuitBreaker::new("db", config(5, Duration::from_secs(60)));
        cb.open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_timer() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_millis(20)));
        let _ = fail(&cb).await;
        cb.close();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_without_runtime_uses_lazy_transition() {
        let cb = CircuitBreaker::new("db", config(1, Duration::from_millis(1)));
        cb.open();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(cb.admit(), Admission::Probe(_)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.is_empty());

        let a = registry.get_or_create("database");
        let b = registry.get_or_create("database");
        a.open();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.open_circuits(), vec!["database".to_string()]);

        registry.get_or_create("api");
        let names: Vec<String> = registry.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["api".to_string(), "database".to_string()]);

        registry.reset_all();
        assert!(registry.open_circuits().is_empty());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_independent_registries() {
        let r1 = CircuitBreakerRegistry::default();
        let r2 = CircuitBreakerRegistry::default();
        r1.get_or_create("db").open();
        assert_eq!(r2.get_or_create("db").state(), CircuitState::Closed);
    }
}
