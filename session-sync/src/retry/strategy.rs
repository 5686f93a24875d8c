//! Exponential-backoff retry execution.
//!
//! Retry eligibility is decided by the error taxonomy
//! ([`ErrorKind::is_retryable`]) unless the caller supplies an explicit
//! allow-list. Non-eligible errors propagate immediately with no delay.
//! The base delay grows purely exponentially (jitter, when enabled, is
//! applied on top and never feeds back into the growth), and a
//! server-supplied `Retry-After` overrides the computed delay for that
//! sleep. Observers are notified before every sleep and once on final
//! exhaustion, which is where audit logging hangs off.

use std::time::Duration;

use rand::Rng;

use valo_protocol::{ApplicationError, ErrorKind};

/// Tuning for [`execute_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total invocations are
    /// `max_retries + 1` when every attempt fails.
    pub max_retries: usize,
    pub initial_delay: Duration,
    /// Cap applied to each sleep, not to the growth of the base delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 0.0 keeps delays deterministic; 0.5 spreads each sleep ±50%.
    pub jitter_factor: f64,
    /// Explicit allow-list of retryable kinds. `None` defers to the
    /// taxonomy's retryability table.
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            retry_on: None,
        }
    }
}

impl RetryConfig {
    fn eligible(&self, error: &ApplicationError) -> bool {
        match &self.retry_on {
            Some(kinds) => kinds.contains(&error.kind),
            None => error.is_retryable(),
        }
    }
}

/// Observation hooks for audit logging and telemetry.
pub trait RetryObserver: Send + Sync {
    /// Called before each backoff sleep; `attempt` is the 1-indexed
    /// attempt that just failed.
    fn on_retry(&self, attempt: usize, error: &ApplicationError, delay: Duration) {
        let _ = (attempt, error, delay);
    }

    /// Called once when retries are exhausted, before the last error
    /// propagates.
    fn on_failure(&self, error: &ApplicationError, total_attempts: usize) {
        let _ = (error, total_attempts);
    }
}

/// Default observer: structured warn/error events.
pub struct TracingObserver;

impl RetryObserver for TracingObserver {
    fn on_retry(&self, attempt: usize, error: &ApplicationError, delay: Duration) {
        tracing::warn!(
            attempt,
            code = error.code(),
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "transient failure, backing off before retry"
        );
    }

    fn on_failure(&self, error: &ApplicationError, total_attempts: usize) {
        tracing::error!(
            total_attempts,
            code = error.code(),
            error = %error,
            "retries exhausted"
        );
    }
}

/// Run `operation`, retrying eligible failures with exponential backoff.
///
/// The first attempt runs immediately. Non-eligible errors propagate
/// untouched with no further attempts; after `max_retries` eligible
/// failures the *last* error propagates.
pub async fn execute_with_backoff<F, Fut, T>(
    mut operation: F,
    config: &RetryConfig,
    observer: &dyn RetryObserver,
) -> Result<T, ApplicationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplicationError>>,
{
    let mut attempt = 0usize;
    let mut current_delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !config.eligible(&error) {
                    return Err(error);
                }
                if attempt > config.max_retries {
                    observer.on_failure(&error, attempt);
                    return Err(error);
                }

                let base = current_delay.min(config.max_delay);
                let delay = match error.retry_after {
                    Some(hint) => hint,
                    None => apply_jitter(base, config.jitter_factor),
                };
                observer.on_retry(attempt, &error, delay);
                tokio::time::sleep(delay).await;

                current_delay = current_delay.mul_f64(config.backoff_multiplier);
            }
        }
    }
}

fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return delay;
    }
    let spread = rand::rng().random_range(-jitter_factor..=jitter_factor);
    delay.mul_f64((1.0 + spread).max(0.0))
}
