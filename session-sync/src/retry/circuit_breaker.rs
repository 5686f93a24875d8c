//! Circuit breaker for failing remote dependencies.
//!
//! One breaker instance guards one logical endpoint class. Calls pass
//! through while `Closed`; once consecutive failures reach the threshold
//! the breaker opens and fails fast without invoking the wrapped
//! operation until the reset timeout elapses, after which a half-open
//! probe phase decides between closing again and re-opening. All state
//! transitions are serialized behind a mutex, so two concurrent
//! half-open probes cannot disagree about the outcome.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use valo_protocol::ApplicationError;

/// Gate position of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast; calls are rejected until the reset timeout elapses.
    Open,
    /// Probing whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Half-open successes required to close again.
    pub success_threshold: u32,
    /// Cooldown before an open breaker allows a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Telemetry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    rejected_calls: u64,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                rejected_calls: 0,
                opened_at: None,
                last_failure_at: None,
                last_success_at: None,
            }),
        }
    }

    /// Run `operation` through the breaker gate.
    ///
    /// An open breaker rejects without constructing or polling the
    /// wrapped future; the rejection error carries the breaker name and
    /// state in its context.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, ApplicationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApplicationError>>,
    {
        self.check_gate()?;
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_gate(&self) -> Result<(), ApplicationError> {
        let mut inner = self.lock();
        inner.total_calls += 1;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!(circuit = %self.name, "reset timeout elapsed, probing half-open");
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(
                        ApplicationError::integration(format!(
                            "circuit breaker '{}' is open",
                            self.name
                        ))
                        .with_context("circuit", self.name.as_str())
                        .with_context("state", CircuitState::Open.as_str()),
                    )
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.last_success_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    tracing::info!(circuit = %self.name, "recovered, closing circuit");
                }
            }
            // A concurrent probe already failed and re-opened; this
            // success must not count toward closing.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.success_count = 0;
        tracing::warn!(
            circuit = %self.name,
            failure_count = inner.failure_count,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "failure threshold reached, opening circuit"
        );
    }
}
