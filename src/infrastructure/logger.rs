//! Logging and Performance Tracking
//!
//! Categorized `tracing` events plus checkpoint-based operation timing.

use crate::config::Config;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

/// Subsystem a log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Startup,
    Database,
    Cache,
    Circuit,
    Retry,
    Pool,
    Health,
    Shutdown,
    Http,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Startup => "startup",
            LogCategory::Database => "database",
            LogCategory::Cache => "cache",
            LogCategory::Circuit => "circuit",
            LogCategory::Retry => "retry",
            LogCategory::Pool => "pool",
            LogCategory::Health => "health",
            LogCategory::Shutdown => "shutdown",
            LogCategory::Http => "http",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global fmt subscriber.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(cfg: &Config) {
    let log_level = if cfg.debug || cfg.is_development() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Logger bound to one category.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    category: LogCategory,
}

impl Logger {
    pub const fn new(category: LogCategory) -> Self {
        Self { category }
    }

    pub fn category(&self) -> LogCategory {
        self.category
    }

    pub fn debug(&self, message: impl std::fmt::Display) {
        tracing::debug!(category = self.category.as_str(), "{}", message);
    }

    pub fn info(&self, message: impl std::fmt::Display) {
        tracing::info!(category = self.category.as_str(), "{}", message);
    }

    pub fn warn(&self, message: impl std::fmt::Display) {
        tracing::warn!(category = self.category.as_str(), "{}", message);
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        tracing::error!(category = self.category.as_str(), "{}", message);
    }
}

const TIMING_HISTORY: usize = 100;

/// Elapsed time at a named point of an operation.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub label: String,
    /// Milliseconds since the operation started
    pub at_ms: u64,
    /// Milliseconds since the previous checkpoint
    pub delta_ms: u64,
}

/// Completed operation timing.
#[derive(Debug, Clone, Serialize)]
pub struct TimingReport {
    pub operation: String,
    pub total_ms: u64,
    pub checkpoints: Vec<Checkpoint>,
}

/// Aggregate over recorded timings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingSummary {
    pub operations: usize,
    pub average_ms: u64,
    pub slowest: Option<String>,
    pub slowest_ms: u64,
}

/// Records operation timings.
///
/// Cheap to clone; clones share history.
#[derive(Clone, Default)]
pub struct PerformanceTracker {
    history: Arc<Mutex<VecDeque<TimingReport>>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin timing an operation.
    pub fn start(&self, operation: impl Into<String>) -> OperationTimer {
        let now = Instant::now();
        OperationTimer {
            operation: operation.into(),
            started: now,
            last: now,
            checkpoints: Vec::new(),
            tracker: self.clone(),
        }
    }

    fn record(&self, report: TimingReport) {
        let mut history = self.history.lock();
        if history.len() >= TIMING_HISTORY {
            history.pop_front();
        }
        history.push_back(report);
    }

    /// Most recent reports, oldest first.
    pub fn recent(&self) -> Vec<TimingReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// Latest report for an operation.
    pub fn last(&self, operation: &str) -> Option<TimingReport> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|r| r.operation == operation)
            .cloned()
    }

    pub fn summary(&self) -> TimingSummary {
        let history = self.history.lock();
        if history.is_empty() {
            return TimingSummary::default();
        }

        let total: u64 = history.iter().map(|r| r.total_ms).sum();
        let slowest = history.iter().max_by_key(|r| r.total_ms);

        TimingSummary {
            operations: history.len(),
            average_ms: total / history.len() as u64,
            slowest: slowest.map(|r| r.operation.clone()),
            slowest_ms: slowest.map(|r| r.total_ms).unwrap_or(0),
        }
    }
}

/// In-flight timing handle.
pub struct OperationTimer {
    operation: String,
    started: Instant,
    last: Instant,
    checkpoints: Vec<Checkpoint>,
    tracker: PerformanceTracker,
}

impl OperationTimer {
    /// Mark a named point.
    pub fn checkpoint(&mut self, label: impl Into<String>) -> Duration {
        let now = Instant::now();
        let delta = now.duration_since(self.last);
        self.checkpoints.push(Checkpoint {
            label: label.into(),
            at_ms: now.duration_since(self.started).as_millis() as u64,
            delta_ms: delta.as_millis() as u64,
        });
        self.last = now;
        delta
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop timing, log the breakdown and record it.
    pub fn finish(self) -> TimingReport {
        let report = TimingReport {
            operation: self.operation,
            total_ms: self.started.elapsed().as_millis() as u64,
            checkpoints: self.checkpoints,
        };

        for cp in &report.checkpoints {
            tracing::debug!(
                category = "perf",
                "{} checkpoint {} at {}ms (+{}ms)",
                report.operation,
                cp.label,
                cp.at_ms,
                cp.delta_ms
            );
        }
        tracing::info!(
            category = "perf",
            "{} completed in {}ms",
            report.operation,
            report.total_ms
        );

        self.tracker.record(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(LogCategory::Startup.to_string(), "startup");
        assert_eq!(LogCategory::Pool.as_str(), "pool");
        assert_eq!(Logger::new(LogCategory::Cache).category(), LogCategory::Cache);
    }

    #[test]
    fn test_timer_checkpoints() {
        let tracker = PerformanceTracker::new();
        let mut timer = tracker.start("boot");
        std::thread::sleep(Duration::from_millis(5));
        timer.checkpoint("essential");
        timer.checkpoint("core");

        let report = timer.finish();
        assert_eq!(report.operation, "boot");
        assert_eq!(report.checkpoints.len(), 2);
        assert!(report.checkpoints[0].at_ms >= 5);
        assert!(report.total_ms >= report.checkpoints[1].at_ms);
    }

    #[test]
    fn test_history_bounded() {
        let tracker = PerformanceTracker::new();
        for i in 0..(TIMING_HISTORY + 5) {
            tracker.start(format!("op-{}", i)).finish();
        }
        let recent = tracker.recent();
        assert_eq!(recent.len(), TIMING_HISTORY);
        assert_eq!(recent[0].operation, "op-5");
    }

    #[test]
    fn test_summary_and_last() {
        let tracker = PerformanceTracker::new();
        assert_eq!(tracker.summary().operations, 0);

        tracker.start("a").finish();
        let mut slow = tracker.start("b");
        std::thread::sleep(Duration::from_millis(3));
        slow.checkpoint("x");
        slow.finish();

        let summary = tracker.summary();
        assert_eq!(summary.operations, 2);
        assert_eq!(summary.slowest.as_deref(), Some("b"));
        assert!(tracker.last("a").is_some());
        assert!(tracker.last("missing").is_none());
    }
}
