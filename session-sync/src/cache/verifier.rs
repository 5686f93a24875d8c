//! Background reconciliation of cached sessions against backend truth.
//!
//! Fresh entries are trusted without a round trip. For older ones the
//! verifier fetches the authoritative record: a strictly newer backend
//! copy refreshes the cache, agreement is a no-op, and an explicit
//! not-found — the only conclusive signal — evicts the entry so the
//! next access re-initializes through the orchestrator. Transient
//! failures leave the cache untouched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use valo_backend_client::SessionApi;
use valo_protocol::{ApplicationError, CorrelationId, ErrorKind};

use super::session_cache::SessionCache;

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Entries younger than this are trusted without a backend call.
    pub verify_after: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            verify_after: Duration::from_secs(5 * 60),
        }
    }
}

/// What a verification pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Entry is young enough to trust without a round trip.
    Fresh,
    /// Another verification for this key is already in flight.
    AlreadyRunning,
    /// Nothing cached under this key.
    Missing,
    /// Backend and cache agree.
    Confirmed,
    /// Backend had newer data; cache was overwritten.
    Refreshed,
    /// Backend has no such session; cache entry evicted.
    Evicted,
}

pub struct CacheVerifier {
    api: Arc<dyn SessionApi>,
    cache: Arc<SessionCache>,
    config: VerifierConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl CacheVerifier {
    pub fn new(api: Arc<dyn SessionApi>, cache: Arc<SessionCache>, config: VerifierConfig) -> Self {
        Self {
            api,
            cache,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Fire-and-forget verification. The spawned task owns its error
    /// channel: failures are traced, never surfaced to the caller.
    pub fn verify_in_background(self: &Arc<Self>, report_id: &str) {
        let verifier = Arc::clone(self);
        let report_id = report_id.to_string();
        tokio::spawn(async move {
            match verifier.verify(&report_id).await {
                Ok(outcome) => {
                    tracing::debug!(report_id, outcome = ?outcome, "cache verification finished");
                }
                Err(error) => {
                    tracing::warn!(
                        report_id,
                        code = error.code(),
                        error = %error,
                        "cache verification failed, keeping cached copy"
                    );
                }
            }
        });
    }

    /// Awaitable verification pass; idempotent per key.
    pub async fn verify(&self, report_id: &str) -> Result<VerifyOutcome, ApplicationError> {
        let Some(entry) = self.cache.entry(report_id) else {
            return Ok(VerifyOutcome::Missing);
        };
        let age = entry.age(Utc::now());
        if age < TimeDelta::from_std(self.config.verify_after).unwrap_or(TimeDelta::MAX) {
            return Ok(VerifyOutcome::Fresh);
        }

        if !self.begin(report_id) {
            return Ok(VerifyOutcome::AlreadyRunning);
        }
        let result = self.reconcile(report_id, entry.version).await;
        self.finish(report_id);
        result
    }

    async fn reconcile(
        &self,
        report_id: &str,
        cached_version: i64,
    ) -> Result<VerifyOutcome, ApplicationError> {
        let correlation = CorrelationId::generate();
        match self.api.fetch_session(report_id, &correlation).await {
            Ok(remote) => {
                if remote.version() > cached_version {
                    tracing::info!(
                        report_id,
                        cached_version,
                        remote_version = remote.version(),
                        "backend is newer, refreshing cache"
                    );
                    self.cache.set(report_id, &remote)?;
                    Ok(VerifyOutcome::Refreshed)
                } else {
                    Ok(VerifyOutcome::Confirmed)
                }
            }
            Err(error) if error.kind == ErrorKind::NotFound => {
                tracing::warn!(report_id, "backend has no record for cached session, evicting");
                self.cache.delete(report_id);
                Ok(VerifyOutcome::Evicted)
            }
            // Transient trouble is not conclusive; the cache stays.
            Err(error) => Err(error),
        }
    }

    fn begin(&self, report_id: &str) -> bool {
        self.lock().insert(report_id.to_string())
    }

    fn finish(&self, report_id: &str) {
        self.lock().remove(report_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
