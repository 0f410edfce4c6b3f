//! Retry with Backoff
//!
//! Retries transient failures with exponential backoff and jitter. The whole
//! retry loop can sit behind a circuit breaker so that repeated exhausted
//! operations trip the breaker.
//!
//! # Backoff Schedule (defaults)
//!
//! | Retry | Delay (base) | With ±15% jitter |
//! |-------|--------------|------------------|
//! | 0     | 1s           | 0.85–1.15s       |
//! | 1     | 2s           | 1.7–2.3s         |
//! | 2     | 4s           | 3.4–4.6s         |
//! | 3     | 8s           | 6.8–9.2s         |

use crate::domain::errors::ResilienceError;
use crate::infrastructure::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];
const DEFAULT_RETRYABLE_ERRORS: [&str; 5] =
    ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "EPIPE", "ENOTFOUND"];
const TRANSIENT_MESSAGE_HINTS: [&str; 8] = [
    "timeout",
    "timed out",
    "connection",
    "network",
    "socket hang up",
    "econnreset",
    "temporarily unavailable",
    "unreachable",
];

/// Fallback type used when no fallback is supplied.
type NoFallback<T> = fn(ResilienceError) -> std::future::Ready<Result<T, ResilienceError>>;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub retries: u32,
    /// Exponential growth factor
    pub factor: f64,
    /// Delay before the first retry
    pub min_timeout: Duration,
    /// Upper bound on any single delay
    pub max_timeout: Duration,
    /// Apply ±15% jitter
    pub randomize: bool,
    /// Budget for each attempt
    pub timeout: Duration,
    pub retryable_status_codes: HashSet<u16>,
    pub retryable_errors: HashSet<String>,
    /// Wrap the retry loop in a circuit breaker
    pub use_circuit_breaker: bool,
    /// Reset timeout for the wrapping breaker
    pub breaker_reset_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            factor: 2.0,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(15),
            randomize: true,
            timeout: Duration::from_secs(10),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS.into_iter().collect(),
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .into_iter()
                .map(String::from)
                .collect(),
            use_circuit_breaker: true,
            breaker_reset_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (0-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let min_ms = self.min_timeout.as_millis() as f64;
        let max_ms = self.max_timeout.as_millis() as f64;
        let raw = min_ms * self.factor.powi(attempt as i32);
        Duration::from_millis(raw.min(max_ms).max(0.0) as u64)
    }

    /// Delay before retry `attempt` (0-based), jittered when `randomize` is set.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.randomize {
            return base;
        }

        // Uniform within a band 30% wide centred on the base delay.
        let base_ms = base.as_millis() as f64;
        let band = base_ms * 0.3;
        if band <= 0.0 {
            return base;
        }
        let jittered = base_ms - band / 2.0 + rand::thread_rng().gen_range(0.0..band);
        let capped = jittered.min(self.max_timeout.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Worst-case wall time of one full retry loop.
    pub fn total_budget(&self) -> Duration {
        let attempts = self.retries + 1;
        let backoff: Duration = (0..self.retries).map(|n| self.base_delay(n)).sum();
        self.timeout * attempts + backoff.mul_f64(1.15) + Duration::from_secs(1)
    }

    /// Whether an error is worth another attempt.
    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        match err {
            ResilienceError::Timeout { .. } => true,
            ResilienceError::CircuitOpen { .. } | ResilienceError::RetryExhausted { .. } => false,
            ResilienceError::Operation(op) => {
                if let Some(status) = op.status {
                    if self.retryable_status_codes.contains(&status) {
                        return true;
                    }
                }
                if let Some(code) = &op.code {
                    if self.retryable_errors.contains(code) {
                        return true;
                    }
                }
                let message = op.message.to_lowercase();
                TRANSIENT_MESSAGE_HINTS.iter().any(|hint| message.contains(hint))
            }
        }
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
}

/// Retry counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub operations: u64,
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallbacks: u64,
}

/// Retries operations for one service.
#[derive(Clone)]
pub struct RetryHandler {
    service: String,
    config: Arc<RetryConfig>,
    breaker: Option<CircuitBreaker>,
    counters: Arc<RetryCounters>,
}

impl RetryHandler {
    /// Create a handler. When `use_circuit_breaker` is set the breaker is
    /// taken from `registry`, or created standalone without one.
    pub fn new(
        service: impl Into<String>,
        config: RetryConfig,
        registry: Option<&CircuitBreakerRegistry>,
    ) -> Self {
        let service = service.into();
        let breaker = config.use_circuit_breaker.then(|| {
            let breaker_config = Self::breaker_config(&config);
            let name = format!("{}-retry", service);
            match registry {
                Some(r) => r.get_or_create_with(&name, breaker_config),
                None => CircuitBreaker::new(name, breaker_config),
            }
        });

        Self {
            service,
            config: Arc::new(config),
            breaker,
            counters: Arc::new(RetryCounters::default()),
        }
    }

    /// Breaker settings for a retry loop: trips only across several
    /// exhausted operations and never times out a loop that is still retrying.
    fn breaker_config(config: &RetryConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: (config.retries + 1) * 2,
            reset_timeout: config.breaker_reset_timeout,
            timeout_duration: config.total_budget(),
            recovery_probe: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Run `op` with retries.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.run(op, None::<NoFallback<T>>).await
    }

    /// Run `op` with retries; any terminal error goes to `fallback`.
    pub async fn retry_with_fallback<T, E, F, Fut, FB, FBFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
        FB: FnOnce(ResilienceError) -> FBFut,
        FBFut: Future<Output = Result<T, ResilienceError>>,
    {
        self.run(op, Some(fallback)).await
    }

    async fn run<T, E, F, Fut, FB, FBFut>(
        &self,
        op: F,
        fallback: Option<FB>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
        FB: FnOnce(ResilienceError) -> FBFut,
        FBFut: Future<Output = Result<T, ResilienceError>>,
    {
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        let result = match &self.breaker {
            Some(breaker) => {
                breaker
                    .execute(|token| self.retry_loop(op, token))
                    .await
            }
            None => self.retry_loop(op, CancellationToken::new()).await,
        };

        match result {
            Ok(value) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                match fallback {
                    Some(fb) => {
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            category = "retry",
                            "{} using fallback after error: {}",
                            self.service,
                            err
                        );
                        fb(err).await
                    }
                    None => Err(err),
                }
            }
        }
    }

    async fn retry_loop<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: CancellationToken,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let max_attempts = self.config.retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match self.attempt(&mut op, &cancel).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            category = "retry",
                            "{} succeeded on attempt {}/{}",
                            self.service,
                            attempt,
                            max_attempts
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.config.is_retryable(&err) {
                tracing::debug!(
                    category = "retry",
                    "{} failed with non-retryable error: {}",
                    self.service,
                    err
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    category = "retry",
                    "{} exhausted {} attempts: {}",
                    self.service,
                    attempt,
                    err
                );
                return Err(ResilienceError::RetryExhausted {
                    service: self.service.clone(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.config.delay_for_attempt(attempt - 1);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                category = "retry",
                "{} attempt {}/{} failed: {}; retrying in {}ms",
                self.service,
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(err),
            }
        }
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        op: &mut F,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let token = cancel.child_token();
        match tokio::time::timeout(self.config.timeout, op(token.clone())).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                token.cancel();
                Err(ResilienceError::Timeout {
                    service: self.service.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    pub fn stats(&self) -> RetryStats {
        let c = &self.counters;
        RetryStats {
            operations: c.operations.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("service", &self.service)
            .field("retries", &self.config.retries)
            .field("circuit_breaker", &self.breaker.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::OperationError;
    use crate::infrastructure::circuit_breaker::CircuitState;
    use std::sync::atomic::AtomicU32;

    fn fast_config(retries: u32) -> RetryConfig {
        RetryConfig {
            retries,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(8),
            timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn counting_op(
        calls: Arc<AtomicU32>,
        err: OperationError,
    ) -> impl FnMut(CancellationToken) -> std::future::Ready<Result<(), OperationError>> {
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(err.clone()))
        }
    }

    #[test]
    fn test_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.retries, 3);
        assert!(config.randomize);
        assert!(config.use_circuit_breaker);
        assert!(config.retryable_status_codes.contains(&503));
        assert!(config.retryable_errors.contains("EPIPE"));
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = RetryConfig {
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(2), Duration::from_millis(400));
        assert_eq!(config.base_delay(3), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_within_band_and_bounded() {
        let config = RetryConfig {
            min_timeout: Duration::from_millis(1000),
            max_timeout: Duration::from_millis(3000),
            ..Default::default()
        };
        for _ in 0..200 {
            let d = config.delay_for_attempt(0).as_millis();
            assert!((850..=1150).contains(&d), "delay {} outside band", d);

            let capped = config.delay_for_attempt(5);
            assert!(capped <= config.max_timeout);
        }
    }

    #[test]
    fn test_delays_non_decreasing_without_jitter() {
        let config = RetryConfig {
            randomize: false,
            ..Default::default()
        };
        let delays: Vec<Duration> = (0..6).map(|n| config.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= config.max_timeout));
    }

    #[test]
    fn test_retryable_classification() {
        let config = RetryConfig::default();
        let op = |e: OperationError| ResilienceError::Operation(e);

        assert!(config.is_retryable(&op(OperationError::new("x").with_status(503))));
        assert!(config.is_retryable(&op(OperationError::new("x").with_code("ECONNRESET"))));
        assert!(config.is_retryable(&op(OperationError::new("Network unreachable"))));
        assert!(config.is_retryable(&ResilienceError::Timeout {
            service: "s".to_string(),
            timeout: Duration::from_millis(1),
        }));
        assert!(!config.is_retryable(&op(OperationError::new("bad request").with_status(400))));
        assert!(!config.is_retryable(&ResilienceError::CircuitOpen {
            service: "s".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_retryable_error_runs_retries_plus_one() {
        let handler = RetryHandler::new("api", fast_config(3), None);
        let calls = Arc::new(AtomicU32::new(0));

        let err = handler
            .retry(counting_op(calls.clone(), OperationError::new("x").with_status(503)))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            ResilienceError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, ResilienceError::Operation(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let stats = handler.stats();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_runs_once() {
        let handler = RetryHandler::new("api", fast_config(3), None);
        let calls = Arc::new(AtomicU32::new(0));

        let err = handler
            .retry(counting_op(calls.clone(), OperationError::new("bad").with_status(400)))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ResilienceError::Operation(ref e) if e.status == Some(400)));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let handler = RetryHandler::new("api", fast_config(3), None);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let value = handler
            .retry(move |_| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OperationError::new("connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let config = RetryConfig {
            timeout: Duration::from_millis(10),
            ..fast_config(1)
        };
        let handler = RetryHandler::new("slow", config, None);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let err = handler
            .retry(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<(), OperationError>>()
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.root().is_timeout());
    }

    #[tokio::test]
    async fn test_fallback_receives_last_error() {
        let handler = RetryHandler::new("api", fast_config(1), None);
        let value = handler
            .retry_with_fallback(
                |_| async { Err::<&str, _>(OperationError::new("x").with_status(502)) },
                |err| async move {
                    assert!(matches!(err, ResilienceError::RetryExhausted { .. }));
                    Ok("fallback")
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "fallback");
        assert_eq!(handler.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_breaker_trips_across_operations_not_within_one() {
        let registry = CircuitBreakerRegistry::default();
        let handler = RetryHandler::new("db", fast_config(1), Some(&registry));
        let breaker = handler.breaker().unwrap().clone();
        assert_eq!(breaker.config().failure_threshold, 4);

        let calls = Arc::new(AtomicU32::new(0));
        let _ = handler
            .retry(counting_op(calls.clone(), OperationError::new("x").with_status(500)))
            .await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..3 {
            let _ = handler
                .retry(counting_op(calls.clone(), OperationError::new("x").with_status(500)))
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 8);

        let err = handler
            .retry(counting_op(calls.clone(), OperationError::new("x").with_status(500)))
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert!(registry.get("db-retry").is_some());
    }

    #[test]
    fn test_total_budget_covers_attempts() {
        let config = fast_config(2);
        assert!(config.total_budget() >= config.timeout * 3);
    }
}
