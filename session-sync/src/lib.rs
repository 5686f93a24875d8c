//! Session resilience and synchronization runtime.
//!
//! Keeps a client-held valuation session consistent with the backend
//! despite network failure, concurrent duplicate requests, backend
//! unavailability, and optimistic-write conflicts:
//!
//! - [`retry`] — circuit breaker, exponential-backoff executor, and
//!   request deduplication
//! - [`cache`] — versioned TTL cache over a quota-bounded store, plus
//!   the background verifier that reconciles it against the backend
//! - [`monitor`] — latency classification against named thresholds
//! - [`orchestrator`] — the composition root tying it all together
//!   behind `get_or_create_session` / `get_session`

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cache;
pub mod monitor;
pub mod orchestrator;
pub mod retry;

pub use cache::{
    CacheStats, CacheVerifier, CachedEntry, KeyValueStore, MemoryStore, SessionCache,
    SessionCacheConfig, StoreError, VerifierConfig, VerifyOutcome,
};
pub use monitor::{LatencyClass, MonitorThresholds, OperationStats, PerformanceMonitor};
pub use orchestrator::{SessionSyncConfig, SessionSyncManager, SyncStatus};
pub use retry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, DedupeStats,
    RequestDeduplicator, RetryConfig, RetryObserver, TracingObserver, execute_with_backoff,
};
