//! Coalescing of concurrent identical requests.
//!
//! Callers sharing a key while a request is in flight all await the
//! same shared future; the wrapped operation runs once and its result
//! (success or failure) is handed to every caller. Once the shared
//! future settles the key is released, so a later call with the same
//! key executes fresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use valo_protocol::ApplicationError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ApplicationError>>>;

/// Aggregate counters, exposed for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeStats {
    pub total_calls: u64,
    pub executed_calls: u64,
    pub deduplicated_calls: u64,
}

impl DedupeStats {
    /// Share of calls that were answered by an in-flight request.
    pub fn dedupe_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.deduplicated_calls as f64 / self.total_calls as f64
        }
    }
}

pub struct RequestDeduplicator<T> {
    in_flight: Mutex<HashMap<String, SharedResult<T>>>,
    total_calls: AtomicU64,
    executed_calls: AtomicU64,
    deduplicated_calls: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            total_calls: AtomicU64::new(0),
            executed_calls: AtomicU64::new(0),
            deduplicated_calls: AtomicU64::new(0),
        }
    }

    /// Run `operation` under `key`, or join the in-flight run for that key.
    ///
    /// The factory is only invoked when no request with the same key is
    /// in flight. Errors propagate identically to every sharing caller.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Result<T, ApplicationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApplicationError>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.lock();
            self.total_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(existing) = in_flight.get(key) {
                self.deduplicated_calls.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "joining in-flight request");
                existing.clone()
            } else {
                self.executed_calls.fetch_add(1, Ordering::Relaxed);
                let fut = operation().boxed().shared();
                in_flight.insert(key.to_string(), fut.clone());
                fut
            }
        };

        let result = shared.clone().await;

        // Release the key, but only if it still maps to *this* run; a
        // fresh request may have claimed the key while a slow sharer was
        // still being polled.
        let mut in_flight = self.lock();
        if in_flight.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            in_flight.remove(key);
        }
        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> DedupeStats {
        DedupeStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            executed_calls: self.executed_calls.load(Ordering::Relaxed),
            deduplicated_calls: self.deduplicated_calls.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedResult<T>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use valo_protocol::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_execution() {
        let dedupe = Arc::new(RequestDeduplicator::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let op = |invocations: Arc<AtomicUsize>| async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, ApplicationError>("value".to_string())
        };

        let (a, b) = tokio::join!(
            dedupe.execute("val_1", || op(invocations.clone())),
            dedupe.execute("val_1", || op(invocations.clone())),
        );

        assert_eq!(a.expect("first caller"), "value");
        assert_eq!(b.expect("second caller"), "value");
        assert_eq!(invocations.load(Ordering::SeqCst), 1, "operation ran once");

        let stats = dedupe.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.executed_calls, 1);
        assert_eq!(stats.deduplicated_calls, 1);
        assert!((stats.dedupe_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_propagate_to_every_sharer() {
        let dedupe = Arc::new(RequestDeduplicator::<String>::new());

        let op = || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<String, _>(ApplicationError::network("down"))
        };

        let (a, b) = tokio::join!(
            dedupe.execute("val_1", op),
            dedupe.execute("val_1", op),
        );

        assert_eq!(a.expect_err("first caller").kind, ErrorKind::Network);
        assert_eq!(b.expect_err("second caller").kind, ErrorKind::Network);
        assert_eq!(dedupe.stats().executed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_released_after_settlement() {
        let dedupe = RequestDeduplicator::new();
        let invocations = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = dedupe
                .execute("val_1", || {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 2, "sequential calls run fresh");
        assert_eq!(dedupe.in_flight_count(), 0);
        assert_eq!(dedupe.stats().deduplicated_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_in_parallel() {
        let dedupe = Arc::new(RequestDeduplicator::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let op = |invocations: Arc<AtomicUsize>| async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ApplicationError>(())
        };

        let (a, b) = tokio::join!(
            dedupe.execute("val_1", || op(invocations.clone())),
            dedupe.execute("val_2", || op(invocations.clone())),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(dedupe.stats().deduplicated_calls, 0);
    }
}
