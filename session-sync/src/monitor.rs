//! Latency measurement against named operation thresholds.
//!
//! Purely observational: the monitor wraps an operation, classifies the
//! elapsed time against that operation's thresholds, and emits a
//! structured event plus in-process counters. It never alters results
//! and never fails the wrapped call.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Per-operation latency expectations.
#[derive(Debug, Clone, Copy)]
pub struct MonitorThresholds {
    /// Elapsed time at or under this is `Fast`.
    pub target: Duration,
    /// Elapsed time at or under this is `Acceptable`; beyond it, `Slow`.
    pub acceptable: Duration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            target: Duration::from_millis(100),
            acceptable: Duration::from_millis(500),
        }
    }
}

/// Outcome classification of one measured call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    Fast,
    Acceptable,
    Slow,
}

impl LatencyClass {
    fn as_str(self) -> &'static str {
        match self {
            LatencyClass::Fast => "fast",
            LatencyClass::Acceptable => "acceptable",
            LatencyClass::Slow => "slow",
        }
    }
}

/// Accumulated figures for one operation name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub calls: u64,
    pub slow_calls: u64,
    pub total_elapsed: Duration,
    pub max_elapsed: Duration,
}

impl OperationStats {
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_elapsed / self.calls as u32
        }
    }
}

pub struct PerformanceMonitor {
    default_thresholds: MonitorThresholds,
    thresholds: Mutex<HashMap<String, MonitorThresholds>>,
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            default_thresholds: MonitorThresholds::default(),
            thresholds: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Register expectations for a named operation; unregistered names
    /// use the defaults.
    pub fn set_thresholds(&self, operation: &str, thresholds: MonitorThresholds) {
        lock(&self.thresholds).insert(operation.to_string(), thresholds);
    }

    /// Measure `future`, record the elapsed time, and pass the output
    /// through untouched.
    pub async fn measure<Fut, T>(&self, operation: &str, future: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let output = future.await;
        self.record(operation, start.elapsed());
        output
    }

    pub fn classify(&self, operation: &str, elapsed: Duration) -> LatencyClass {
        let thresholds = lock(&self.thresholds)
            .get(operation)
            .copied()
            .unwrap_or(self.default_thresholds);
        if elapsed <= thresholds.target {
            LatencyClass::Fast
        } else if elapsed <= thresholds.acceptable {
            LatencyClass::Acceptable
        } else {
            LatencyClass::Slow
        }
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        lock(&self.stats).get(operation).copied()
    }

    /// Record an elapsed time measured by the caller.
    pub fn record(&self, operation: &str, elapsed: Duration) {
        let class = self.classify(operation, elapsed);
        {
            let mut stats = lock(&self.stats);
            let entry = stats.entry(operation.to_string()).or_default();
            entry.calls += 1;
            entry.total_elapsed += elapsed;
            entry.max_elapsed = entry.max_elapsed.max(elapsed);
            if class == LatencyClass::Slow {
                entry.slow_calls += 1;
            }
        }

        let elapsed_ms = elapsed.as_millis() as u64;
        if class == LatencyClass::Slow {
            tracing::warn!(operation, elapsed_ms, class = class.as_str(), "operation completed");
        } else {
            tracing::info!(operation, elapsed_ms, class = class.as_str(), "operation completed");
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn measure_passes_output_through() {
        let monitor = PerformanceMonitor::new();
        let value = monitor.measure("noop", async { 42 }).await;
        assert_eq!(value, 42);

        let stats = monitor.stats("noop").expect("recorded");
        assert_eq!(stats.calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operations_are_counted() {
        let monitor = PerformanceMonitor::new();
        monitor.set_thresholds(
            "sync",
            MonitorThresholds {
                target: Duration::from_millis(10),
                acceptable: Duration::from_millis(20),
            },
        );

        monitor
            .measure("sync", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await;

        let stats = monitor.stats("sync").expect("recorded");
        assert_eq!(stats.slow_calls, 1);
        assert!(stats.max_elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn classification_uses_registered_thresholds() {
        let monitor = PerformanceMonitor::new();
        monitor.set_thresholds(
            "create",
            MonitorThresholds {
                target: Duration::from_millis(50),
                acceptable: Duration::from_millis(200),
            },
        );

        assert_eq!(
            monitor.classify("create", Duration::from_millis(30)),
            LatencyClass::Fast
        );
        assert_eq!(
            monitor.classify("create", Duration::from_millis(120)),
            LatencyClass::Acceptable
        );
        assert_eq!(
            monitor.classify("create", Duration::from_millis(500)),
            LatencyClass::Slow
        );
    }

    #[test]
    fn average_is_zero_without_calls() {
        assert_eq!(OperationStats::default().average(), Duration::ZERO);
    }
}
