//! Health Monitor
//!
//! Aggregates per-subsystem health records into one liveness/readiness
//! status. Checks are pluggable, run concurrently, and never fail the cycle:
//! errors, timeouts and panics are folded into the check's own record.

use crate::domain::entities::unix_millis;
use crate::domain::ports::{ConnectionState, Database};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Status of a single subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Never checked
    #[default]
    Unknown,
    Healthy,
    /// Worth a look; does not lower the aggregate
    Warning,
    Degraded,
    Unhealthy,
}

/// Aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    /// HTTP status code for the health endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            OverallStatus::Healthy | OverallStatus::Degraded => 200,
            OverallStatus::Initializing => 503,
            OverallStatus::Unhealthy => 500,
        }
    }

    /// Most severe wins; any never-checked subsystem keeps the system initializing.
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a HealthState>) -> Self {
        let mut unknown = false;
        let mut degraded = false;

        for state in states {
            match state {
                HealthState::Unhealthy => return OverallStatus::Unhealthy,
                HealthState::Degraded => degraded = true,
                HealthState::Unknown => unknown = true,
                HealthState::Healthy | HealthState::Warning => {}
            }
        }

        if degraded {
            OverallStatus::Degraded
        } else if unknown {
            OverallStatus::Initializing
        } else {
            OverallStatus::Healthy
        }
    }
}

/// Per-subsystem record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthRecord {
    pub status: HealthState,
    /// Unix ms of the last check, None until first run
    pub last_check: Option<u64>,
    pub error: Option<String>,
    pub response_time_ms: Option<u64>,
    pub usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Result produced by a [`HealthCheck`].
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub status: HealthState,
    pub error: Option<String>,
    pub usage_percent: Option<f64>,
    pub details: Option<serde_json::Value>,
}

impl CheckOutcome {
    pub fn healthy() -> Self {
        Self::with_status(HealthState::Healthy)
    }

    pub fn with_status(status: HealthState) -> Self {
        Self {
            status,
            error: None,
            usage_percent: None,
            details: None,
        }
    }

    pub fn failed(status: HealthState, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(status)
        }
    }

    pub fn usage(mut self, percent: f64) -> Self {
        self.usage_percent = Some(percent);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A pluggable subsystem check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> CheckOutcome;

    /// Status recorded when the check exceeds its time budget.
    fn timeout_status(&self) -> HealthState {
        HealthState::Degraded
    }
}

/// Entry in the recent-issues ring.
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub check: String,
    pub status: HealthState,
    pub message: String,
    pub timestamp: u64,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub uptime_secs: u64,
    pub timestamp: u64,
    pub checks: BTreeMap<String, HealthRecord>,
    pub recent_issues: Vec<HealthIssue>,
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between polling cycles
    pub check_interval: Duration,
    /// Budget for each individual check
    pub check_timeout: Duration,
    /// Timeout for external API probes
    pub external_timeout: Duration,
    pub recent_issue_limit: usize,
    /// Register the built-in memory and cpu checks
    pub system_checks: bool,
    /// Token unlocking the private tier; None disables it
    pub health_token: Option<String>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            external_timeout: Duration::from_secs(5),
            recent_issue_limit: 10,
            system_checks: true,
            health_token: None,
        }
    }
}

/// Aggregating health monitor.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    started: Instant,
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    records: RwLock<BTreeMap<String, HealthRecord>>,
    issues: Mutex<VecDeque<HealthIssue>>,
    http: reqwest::Client,
    poller: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.external_timeout)
            .build()
            .unwrap_or_default();

        let monitor = Self {
            config,
            started: Instant::now(),
            checks: RwLock::new(Vec::new()),
            records: RwLock::new(BTreeMap::new()),
            issues: Mutex::new(VecDeque::new()),
            http,
            poller: Mutex::new(None),
        };

        if monitor.config.system_checks {
            monitor.register_check(Arc::new(MemoryCheck::new()));
            monitor.register_check(Arc::new(CpuCheck::new()));
        }
        monitor
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Register a check; its record starts as unknown. Replaces a check of the same name.
    pub fn register_check(&self, check: Arc<dyn HealthCheck>) {
        let name = check.name().to_string();
        {
            let mut checks = self.checks.write();
            checks.retain(|c| c.name() != name);
            checks.push(check);
        }
        self.records.write().entry(name).or_default();
    }

    /// Track an external HTTP dependency; non-2xx or errors mark it degraded.
    pub fn register_external_api(&self, name: &str, url: &str) {
        tracing::info!(category = "health", "monitoring external api {} at {}", name, url);
        self.register_check(Arc::new(ExternalApiCheck::new(
            name,
            url,
            self.http.clone(),
        )));
    }

    /// Declare a push-reported subsystem (such as `auth`) as unknown.
    pub fn track(&self, name: &str) {
        self.records.write().entry(name.to_string()).or_default();
    }

    /// Push a status for a subsystem that is not polled.
    pub fn report(&self, name: &str, status: HealthState, error: Option<String>) {
        self.apply(
            name,
            CheckOutcome {
                status,
                error,
                usage_percent: None,
                details: None,
            },
            None,
        );
    }

    fn apply(&self, name: &str, outcome: CheckOutcome, elapsed: Option<Duration>) {
        let previous = {
            let mut records = self.records.write();
            let record = records.entry(name.to_string()).or_default();
            let previous = record.status;
            *record = HealthRecord {
                status: outcome.status,
                last_check: Some(unix_millis()),
                error: outcome.error.clone(),
                response_time_ms: elapsed.map(|d| d.as_millis() as u64),
                usage_percent: outcome.usage_percent,
                details: outcome.details,
            };
            previous
        };

        if previous != outcome.status {
            tracing::info!(
                category = "health",
                "{} changed {:?} -> {:?}",
                name,
                previous,
                outcome.status
            );
        }

        if matches!(outcome.status, HealthState::Degraded | HealthState::Unhealthy) {
            let message = outcome
                .error
                .unwrap_or_else(|| format!("{} is {:?}", name, outcome.status).to_lowercase());
            tracing::warn!(category = "health", "{}: {}", name, message);
            self.push_issue(name, outcome.status, message);
        }
    }

    fn push_issue(&self, check: &str, status: HealthState, message: String) {
        let mut issues = self.issues.lock();
        if issues.len() >= self.config.recent_issue_limit.max(1) {
            issues.pop_front();
        }
        issues.push_back(HealthIssue {
            check: check.to_string(),
            status,
            message,
            timestamp: unix_millis(),
        });
    }

    /// Run every registered check concurrently and return the new aggregate.
    pub async fn check_health(&self) -> OverallStatus {
        let checks: Vec<Arc<dyn HealthCheck>> = self.checks.read().clone();
        let budget = self.config.check_timeout;

        let handles: Vec<_> = checks
            .into_iter()
            .map(|check| {
                let name = check.name().to_string();
                let handle = tokio::spawn(async move {
                    let start = Instant::now();
                    let outcome = match tokio::time::timeout(budget, check.check()).await {
                        Ok(outcome) => outcome,
                        Err(_) => CheckOutcome::failed(
                            check.timeout_status(),
                            format!("check timed out after {}ms", budget.as_millis()),
                        ),
                    };
                    (outcome, start.elapsed())
                });
                (name, handle)
            })
            .collect();

        for (name, handle) in handles {
            match handle.await {
                Ok((outcome, elapsed)) => self.apply(&name, outcome, Some(elapsed)),
                Err(e) => self.apply(
                    &name,
                    CheckOutcome::failed(HealthState::Unhealthy, format!("check aborted: {}", e)),
                    None,
                ),
            }
        }

        self.overall()
    }

    /// Current aggregate without running checks.
    pub fn overall(&self) -> OverallStatus {
        OverallStatus::aggregate(self.records.read().values().map(|r| &r.status))
    }

    pub fn record(&self, name: &str) -> Option<HealthRecord> {
        self.records.read().get(name).cloned()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> HealthSnapshot {
        let checks = self.records.read().clone();
        HealthSnapshot {
            status: OverallStatus::aggregate(checks.values().map(|r| &r.status)),
            uptime_secs: self.uptime().as_secs(),
            timestamp: unix_millis(),
            checks,
            recent_issues: self.issues.lock().iter().cloned().collect(),
        }
    }

    /// Whether `token` unlocks the private tier.
    pub fn verify_token(&self, token: Option<&str>) -> bool {
        match (&self.config.health_token, token) {
            (Some(expected), Some(given)) => !expected.is_empty() && expected == given,
            _ => false,
        }
    }

    /// Start periodic polling. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *poller = Some(cancel.clone());
        let monitor = Arc::downgrade(self);
        // tokio::time::interval panics on a zero period
        let interval = self.config.check_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        let status = monitor.check_health().await;
                        tracing::debug!(category = "health", "health cycle complete: {:?}", status);
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.poller.lock().take() {
            cancel.cancel();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.poller.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// Usage thresholds shared by the memory and cpu checks.
pub fn classify_usage(percent: f64) -> HealthState {
    if percent > 90.0 {
        HealthState::Degraded
    } else if percent > 80.0 {
        HealthState::Warning
    } else {
        HealthState::Healthy
    }
}

fn usage_outcome(kind: &str, sample: Option<f64>) -> CheckOutcome {
    match sample {
        Some(percent) => {
            let percent = (percent * 100.0).round() / 100.0;
            let status = classify_usage(percent);
            let outcome = CheckOutcome::with_status(status).usage(percent);
            if status == HealthState::Healthy {
                outcome
            } else {
                CheckOutcome {
                    error: Some(format!("{} usage at {:.1}%", kind, percent)),
                    ..outcome
                }
            }
        }
        None => CheckOutcome::failed(
            HealthState::Warning,
            format!("{} statistics unavailable", kind),
        ),
    }
}

type UsageSampler = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

/// Database reachability.
pub struct DatabaseCheck {
    db: Arc<dyn Database>,
}

impl DatabaseCheck {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HealthCheck for DatabaseCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> CheckOutcome {
        match self.db.state() {
            ConnectionState::Pending => CheckOutcome::with_status(HealthState::Unknown),
            ConnectionState::Failed(e) => CheckOutcome::failed(HealthState::Unhealthy, e),
            ConnectionState::Closed => {
                CheckOutcome::failed(HealthState::Unhealthy, "database closed")
            }
            ConnectionState::Connected => match self.db.ping().await {
                Ok(()) => CheckOutcome::healthy(),
                Err(e) => CheckOutcome::failed(HealthState::Unhealthy, e.to_string()),
            },
        }
    }

    fn timeout_status(&self) -> HealthState {
        HealthState::Unhealthy
    }
}

/// System memory usage from `/proc/meminfo`.
pub struct MemoryCheck {
    sampler: UsageSampler,
}

impl MemoryCheck {
    pub fn new() -> Self {
        Self::with_sampler(Arc::new(read_memory_usage))
    }

    pub fn with_sampler(sampler: UsageSampler) -> Self {
        Self { sampler }
    }
}

impl Default for MemoryCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> CheckOutcome {
        usage_outcome("memory", (self.sampler)())
    }
}

fn read_memory_usage() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

/// One-minute load average relative to available cores.
pub struct CpuCheck {
    sampler: UsageSampler,
}

impl CpuCheck {
    pub fn new() -> Self {
        Self::with_sampler(Arc::new(read_cpu_load))
    }

    pub fn with_sampler(sampler: UsageSampler) -> Self {
        Self { sampler }
    }
}

impl Default for CpuCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheck for CpuCheck {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn check(&self) -> CheckOutcome {
        usage_outcome("cpu", (self.sampler)())
    }
}

fn read_cpu_load() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().ok()?.get() as f64;
    Some(one_minute / cores * 100.0)
}

/// HTTP GET probe against an external dependency.
pub struct ExternalApiCheck {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl ExternalApiCheck {
    pub fn new(name: &str, url: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl HealthCheck for ExternalApiCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> CheckOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => CheckOutcome::healthy(),
            Ok(resp) => CheckOutcome::failed(
                HealthState::Degraded,
                format!("unhealthy status: {}", resp.status()),
            ),
            Err(e) => CheckOutcome::failed(HealthState::Degraded, format!("request failed: {}", e)),
        }
    }
}
