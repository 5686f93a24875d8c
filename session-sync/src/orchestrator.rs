//! Optimistic session creation with background backend synchronization.
//!
//! [`SessionSyncManager`] is the composition root of the runtime: it
//! owns one breaker per endpoint class, the deduplicator, the monitor,
//! the cache, and the verifier, all constructor-injected so tests can
//! build isolated instances.
//!
//! Creation is offline-first. The caller gets a locally constructed
//! session back immediately; a background task then pushes it to the
//! backend through dedupe → monitor → retry → breaker. A conflict means
//! someone else created the session first, so the existing record is
//! loaded and becomes authoritative. Any other failure is contained:
//! the local copy keeps working and only the sync status records that
//! the backend has no matching record yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use valo_backend_client::SessionApi;
use valo_protocol::{
    ApplicationError, CorrelationId, ErrorKind, SessionView, ValuationSession, Value, ValueMap,
};

use crate::cache::{CacheVerifier, KeyValueStore, SessionCache, SessionCacheConfig, VerifierConfig};
use crate::monitor::{MonitorThresholds, PerformanceMonitor};
use crate::retry::{
    CircuitBreaker, CircuitBreakerConfig, RequestDeduplicator, RetryConfig, TracingObserver,
    execute_with_backoff,
};

const OP_CREATE_SYNC: &str = "session_create_sync";
const OP_UPDATE_SYNC: &str = "session_update_sync";
const OP_LOAD_SESSION: &str = "session_load";

/// Fixed delays between attempts to load the existing record after a
/// create conflict; generous enough to ride out replication lag.
pub const DEFAULT_CONFLICT_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

#[derive(Debug, Clone)]
pub struct SessionSyncConfig {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub cache: SessionCacheConfig,
    pub verifier: VerifierConfig,
    pub conflict_retry_delays: Vec<Duration>,
}

impl Default for SessionSyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            cache: SessionCacheConfig::default(),
            verifier: VerifierConfig::default(),
            conflict_retry_delays: DEFAULT_CONFLICT_DELAYS.to_vec(),
        }
    }
}

/// Per-report synchronization state. Both terminal states permit
/// continued local use; only `Synced` guarantees a backend record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Syncing,
    Synced,
    SyncFailed,
}

pub struct SessionSyncManager {
    api: Arc<dyn SessionApi>,
    cache: Arc<SessionCache>,
    verifier: Arc<CacheVerifier>,
    session_breaker: Arc<CircuitBreaker>,
    dedupe: Arc<RequestDeduplicator<ValuationSession>>,
    monitor: Arc<PerformanceMonitor>,
    retry: RetryConfig,
    conflict_retry_delays: Vec<Duration>,
    statuses: Mutex<HashMap<String, SyncStatus>>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionSyncManager {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: Arc<dyn KeyValueStore>,
        config: SessionSyncConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(SessionCache::new(store, config.cache));
        let verifier = Arc::new(CacheVerifier::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            config.verifier,
        ));
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.set_thresholds(
            "get_or_create_session",
            MonitorThresholds {
                target: Duration::from_millis(50),
                acceptable: Duration::from_millis(200),
            },
        );
        for operation in [OP_CREATE_SYNC, OP_UPDATE_SYNC, OP_LOAD_SESSION] {
            monitor.set_thresholds(
                operation,
                MonitorThresholds {
                    target: Duration::from_millis(500),
                    acceptable: Duration::from_secs(2),
                },
            );
        }

        Arc::new(Self {
            api,
            cache,
            verifier,
            session_breaker: Arc::new(CircuitBreaker::new("session-api", config.breaker)),
            dedupe: Arc::new(RequestDeduplicator::new()),
            monitor,
            retry: config.retry,
            conflict_retry_delays: config.conflict_retry_delays,
            statuses: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Return a usable session for `report_id` without waiting on the
    /// network.
    ///
    /// A cached session is returned as-is (with verification kicked off
    /// in the background). Otherwise an optimistic local session is
    /// constructed, cached, and handed back while a background task
    /// creates it on the backend. Only parameter validation can fail.
    pub async fn get_or_create_session(
        self: &Arc<Self>,
        report_id: &str,
        view: SessionView,
        prefilled: Option<ValueMap>,
    ) -> Result<ValuationSession, ApplicationError> {
        let start = tokio::time::Instant::now();
        if report_id.trim().is_empty() {
            return Err(ApplicationError::validation("reportId must not be empty"));
        }

        if let Some(cached) = self.cache.get(report_id) {
            self.verifier.verify_in_background(report_id);
            self.monitor.record("get_or_create_session", start.elapsed());
            return Ok(cached);
        }

        let session =
            ValuationSession::new_local(report_id, view, prefilled.unwrap_or_default());
        self.cache.set(report_id, &session)?;
        self.set_status(report_id, SyncStatus::Syncing);
        self.spawn_create_sync(session.clone());

        self.monitor.record("get_or_create_session", start.elapsed());
        tracing::info!(
            report_id,
            session_id = %session.session_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "optimistic session created, backend sync scheduled"
        );
        Ok(session)
    }

    /// Cache-first lookup of an existing session.
    ///
    /// A backend 404 is the genuine "no such report" answer and comes
    /// back as `Ok(None)`. Other remote failures propagate — with
    /// nothing cached there is no local copy to degrade to.
    pub async fn get_session(
        self: &Arc<Self>,
        report_id: &str,
    ) -> Result<Option<ValuationSession>, ApplicationError> {
        if report_id.trim().is_empty() {
            return Err(ApplicationError::validation("reportId must not be empty"));
        }

        if let Some(cached) = self.cache.get(report_id) {
            self.verifier.verify_in_background(report_id);
            return Ok(Some(cached));
        }

        let key = format!("load:{report_id}");
        let fetched = self
            .dedupe
            .execute(&key, || self.clone().load_pipeline(report_id.to_string()))
            .await;

        match fetched {
            Ok(remote) => {
                self.cache.set_if_newer(report_id, &remote)?;
                Ok(Some(remote))
            }
            Err(error) if error.kind == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Record one in-progress answer and sync it in the background.
    ///
    /// The read-modify-write against the cache is serialized per report
    /// so concurrent edits cannot lose updates.
    pub async fn record_answer(
        self: &Arc<Self>,
        report_id: &str,
        field: &str,
        value: Value,
    ) -> Result<ValuationSession, ApplicationError> {
        if field.trim().is_empty() {
            return Err(ApplicationError::validation("field name must not be empty"));
        }

        let lock = self.write_lock(report_id);
        let _guard = lock.lock().await;

        let mut session = self.cache.get(report_id).ok_or_else(|| {
            ApplicationError::not_found(format!("no active session for report {report_id}"))
        })?;
        session.partial_data.insert(field, value);
        session.touch();
        self.cache.set(report_id, &session)?;

        self.set_status(report_id, SyncStatus::Syncing);
        self.spawn_update_sync(session.clone());
        Ok(session)
    }

    /// Synchronization state for a report, if any sync was attempted.
    pub fn sync_status(&self, report_id: &str) -> Option<SyncStatus> {
        lock(&self.statuses).get(report_id).copied()
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn verifier(&self) -> &Arc<CacheVerifier> {
        &self.verifier
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator<ValuationSession> {
        &self.dedupe
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.session_breaker
    }

    fn spawn_create_sync(self: &Arc<Self>, local: ValuationSession) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let report_id = local.report_id.clone();
            let status = match manager.sync_create(local).await {
                Ok(()) => {
                    tracing::info!(report_id, "session synced to backend");
                    SyncStatus::Synced
                }
                Err(error) => manager.contain_sync_failure(&report_id, "create", &error),
            };
            manager.set_status(&report_id, status);
        });
    }

    fn spawn_update_sync(self: &Arc<Self>, session: ValuationSession) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let report_id = session.report_id.clone();
            let status = match manager.sync_update(session).await {
                Ok(()) => SyncStatus::Synced,
                Err(error) => manager.contain_sync_failure(&report_id, "update", &error),
            };
            manager.set_status(&report_id, status);
        });
    }

    /// Push an optimistic creation to the backend. Deduplicated per
    /// report, so concurrent optimistic creations collapse into one
    /// backend call whose outcome every task shares.
    async fn sync_create(self: &Arc<Self>, local: ValuationSession) -> Result<(), ApplicationError> {
        let key = format!("create:{}", local.report_id);
        self.dedupe
            .execute(&key, || self.clone().create_pipeline(local))
            .await?;
        Ok(())
    }

    async fn create_pipeline(
        self: Arc<Self>,
        local: ValuationSession,
    ) -> Result<ValuationSession, ApplicationError> {
        let report_id = local.report_id.clone();
        let manager = Arc::clone(&self);
        self.monitor
            .measure(OP_CREATE_SYNC, async move {
                let correlation = CorrelationId::generate();
                let created = execute_with_backoff(
                    || {
                        let api = Arc::clone(&manager.api);
                        let breaker = Arc::clone(&manager.session_breaker);
                        let session = local.clone();
                        let correlation = correlation.clone();
                        async move {
                            breaker
                                .execute(|| async {
                                    api.create_session(&session, &correlation).await
                                })
                                .await
                        }
                    },
                    &manager.retry,
                    &TracingObserver,
                )
                .await;

                match created {
                    Ok(remote) => {
                        manager.cache.set_if_newer(&report_id, &remote)?;
                        Ok(remote)
                    }
                    Err(error) if error.kind == ErrorKind::SessionConflict => {
                        tracing::info!(
                            report_id,
                            "session already exists on backend, loading existing record"
                        );
                        let existing = manager.load_existing_after_conflict(&report_id).await?;
                        // The backend record is authoritative after a
                        // conflict even when its timestamp is older than
                        // the optimistic copy's.
                        manager.cache.set(&report_id, &existing)?;
                        Ok(existing)
                    }
                    Err(error) => Err(error),
                }
            })
            .await
    }

    /// Fetch the record that won the create race. Replication may lag
    /// behind the 409, so a handful of fixed-delay attempts.
    async fn load_existing_after_conflict(
        &self,
        report_id: &str,
    ) -> Result<ValuationSession, ApplicationError> {
        let correlation = CorrelationId::generate();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.api.fetch_session(report_id, &correlation).await {
                Ok(session) => return Ok(session),
                Err(error) => {
                    if attempt > self.conflict_retry_delays.len() {
                        return Err(error);
                    }
                    let delay = self.conflict_retry_delays[attempt - 1];
                    tracing::debug!(
                        report_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "existing session not visible yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn sync_update(self: &Arc<Self>, session: ValuationSession) -> Result<(), ApplicationError> {
        let manager = Arc::clone(self);
        let report_id = session.report_id.clone();
        let remote = self
            .monitor
            .measure(OP_UPDATE_SYNC, async move {
                let correlation = CorrelationId::generate();
                execute_with_backoff(
                    || {
                        let api = Arc::clone(&manager.api);
                        let breaker = Arc::clone(&manager.session_breaker);
                        let session = session.clone();
                        let correlation = correlation.clone();
                        async move {
                            breaker
                                .execute(|| async {
                                    api.update_session(&session, &correlation).await
                                })
                                .await
                        }
                    },
                    &manager.retry,
                    &TracingObserver,
                )
                .await
            })
            .await?;
        self.cache.set_if_newer(&report_id, &remote)?;
        Ok(())
    }

    async fn load_pipeline(
        self: Arc<Self>,
        report_id: String,
    ) -> Result<ValuationSession, ApplicationError> {
        let manager = Arc::clone(&self);
        self.monitor
            .measure(OP_LOAD_SESSION, async move {
                let correlation = CorrelationId::generate();
                execute_with_backoff(
                    || {
                        let api = Arc::clone(&manager.api);
                        let breaker = Arc::clone(&manager.session_breaker);
                        let report_id = report_id.clone();
                        let correlation = correlation.clone();
                        async move {
                            breaker
                                .execute(|| async {
                                    api.fetch_session(&report_id, &correlation).await
                                })
                                .await
                        }
                    },
                    &manager.retry,
                    &TracingObserver,
                )
                .await
            })
            .await
    }

    /// The single swallow-and-degrade point: every contained sync
    /// failure funnels through here so the policy stays testable.
    fn contain_sync_failure(
        &self,
        report_id: &str,
        phase: &str,
        error: &ApplicationError,
    ) -> SyncStatus {
        tracing::warn!(
            report_id,
            phase,
            code = error.code(),
            error = %error,
            "background sync failed; local session stays authoritative"
        );
        SyncStatus::SyncFailed
    }

    fn set_status(&self, report_id: &str, status: SyncStatus) {
        lock(&self.statuses).insert(report_id.to_string(), status);
    }

    fn write_lock(&self, report_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.write_locks)
            .entry(report_id.to_string())
            .or_default()
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
