//! Versioned, TTL-bound local cache of session snapshots.
//!
//! Entries carry the version they were written at (derived from the
//! session's `updated_at`) so authoritative refreshes can refuse to go
//! backwards, and a completeness marker so a pre-completion snapshot is
//! never served as if it were final: an entry without a terminal
//! artifact that outlives the incomplete-staleness window is purged and
//! the caller forced back through the network path.
//!
//! Storage failures never propagate out of a write. Quota exhaustion
//! walks a degrade ladder — evict oldest entries and retry, then fall
//! back to a minimal identity-only entry, then log and drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use valo_protocol::{ApplicationError, ValuationSession};

use super::store::{KeyValueStore, StoreError};

/// Entries evicted per pass when a write hits the storage quota.
const QUOTA_EVICTION_BATCH: usize = 5;

#[derive(Debug, Clone)]
pub struct SessionCacheConfig {
    /// Hard lifetime of an entry.
    pub ttl: Duration,
    /// Age past which an entry without completion markers is purged.
    pub incomplete_max_age: Duration,
    /// Entry-count bound; oldest `cached_at` is evicted first.
    pub max_entries: usize,
    pub key_prefix: String,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            incomplete_max_age: Duration::from_secs(10 * 60),
            max_entries: 50,
            key_prefix: "valuation_session:".to_string(),
        }
    }
}

/// What actually sits in the store, JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntry {
    pub session: ValuationSession,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: i64,
}

impl CachedEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.cached_at)
    }
}

/// Telemetry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

pub struct SessionCache {
    store: Arc<dyn KeyValueStore>,
    config: SessionCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl SessionCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: SessionCacheConfig) -> Self {
        Self {
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache a session snapshot.
    ///
    /// The only error that escapes is a validation failure of the
    /// session itself; storage trouble degrades internally.
    pub fn set(&self, report_id: &str, session: &ValuationSession) -> Result<(), ApplicationError> {
        session.validate()?;
        let stripped = session.stripped_for_cache();
        let entry = self.build_entry(stripped);
        let payload = serde_json::to_string(&entry).map_err(|e| {
            ApplicationError::validation(format!("session is not serializable: {e}"))
                .with_context("reportId", report_id)
        })?;

        let key = self.storage_key(report_id);
        self.write_with_degrade(&key, &payload, &entry.session);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.enforce_entry_limit();
        Ok(())
    }

    /// Overwrite only if `session` is at least as new as the cached copy.
    /// Returns whether a write happened.
    pub fn set_if_newer(
        &self,
        report_id: &str,
        session: &ValuationSession,
    ) -> Result<bool, ApplicationError> {
        if let Some(existing) = self.entry(report_id)
            && session.version() < existing.version
        {
            tracing::debug!(
                report_id,
                incoming_version = session.version(),
                cached_version = existing.version,
                "discarding stale write"
            );
            return Ok(false);
        }
        self.set(report_id, session)?;
        Ok(true)
    }

    /// Fetch a live session, applying every liveness rule. Corrupt,
    /// expired, and stale-incomplete entries are deleted on the way out.
    pub fn get(&self, report_id: &str) -> Option<ValuationSession> {
        let key = self.storage_key(report_id);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "cache read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry: CachedEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(key, error = %error, "corrupt cache entry, deleting");
                self.delete(report_id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            self.delete(report_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if !entry.session.is_complete()
            && entry.age(now) > delta(self.config.incomplete_max_age)
        {
            tracing::debug!(
                report_id,
                age_secs = entry.age(now).num_seconds(),
                "incomplete entry outlived its staleness window, purging"
            );
            self.delete(report_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.session)
    }

    /// Raw entry access for reconciliation; applies no liveness rules.
    pub fn entry(&self, report_id: &str) -> Option<CachedEntry> {
        let raw = self.store.get(&self.storage_key(report_id)).ok()??;
        serde_json::from_str(&raw).ok()
    }

    pub fn has(&self, report_id: &str) -> bool {
        self.entry(report_id)
            .is_some_and(|entry| !entry.is_expired(Utc::now()))
    }

    pub fn delete(&self, report_id: &str) {
        if let Err(error) = self.store.remove(&self.storage_key(report_id)) {
            tracing::warn!(report_id, error = %error, "cache delete failed");
        }
    }

    /// Sweep every cache key and drop expired entries. Returns how many
    /// were removed (corrupt entries count, they are removed too).
    pub fn clean_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for key in self.cache_keys() {
            let Ok(Some(raw)) = self.store.get(&key) else {
                continue;
            };
            let drop = match serde_json::from_str::<CachedEntry>(&raw) {
                Ok(entry) => entry.is_expired(now),
                Err(_) => true,
            };
            if drop && self.store.remove(&key).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "expired cache entries swept");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn storage_key(&self, report_id: &str) -> String {
        format!("{}{report_id}", self.config.key_prefix)
    }

    fn build_entry(&self, session: ValuationSession) -> CachedEntry {
        let cached_at = Utc::now();
        let expires_at = cached_at
            .checked_add_signed(delta(self.config.ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let version = session.version();
        CachedEntry {
            session,
            cached_at,
            expires_at,
            version,
        }
    }

    fn write_with_degrade(&self, key: &str, payload: &str, session: &ValuationSession) {
        match self.store.set(key, payload) {
            Ok(()) => {}
            Err(StoreError::QuotaExceeded { attempted, quota }) => {
                tracing::warn!(key, attempted, quota, "storage quota hit, evicting oldest entries");
                self.evict_oldest(QUOTA_EVICTION_BATCH);
                if self.store.set(key, payload).is_ok() {
                    return;
                }
                self.write_minimal(key, session);
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "cache write failed, dropping");
            }
        }
    }

    /// Last rung of the degrade ladder: identity and timestamps only.
    fn write_minimal(&self, key: &str, session: &ValuationSession) {
        let mut minimal = session.clone();
        minimal.partial_data.clear();
        minimal.session_data.clear();
        minimal.valuation_result = None;
        minimal.report_html = None;

        let entry = self.build_entry(minimal);
        let Ok(payload) = serde_json::to_string(&entry) else {
            return;
        };
        if let Err(error) = self.store.set(key, &payload) {
            tracing::error!(key, error = %error, "even minimal cache entry failed, dropping write");
        }
    }

    fn cache_keys(&self) -> Vec<String> {
        match self.store.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| key.starts_with(&self.config.key_prefix))
                .collect(),
            Err(error) => {
                tracing::warn!(error = %error, "cache key listing failed");
                Vec::new()
            }
        }
    }

    /// Oldest-first eviction of up to `count` entries.
    fn evict_oldest(&self, count: usize) {
        let mut aged: Vec<(String, DateTime<Utc>)> = self
            .cache_keys()
            .into_iter()
            .filter_map(|key| {
                let raw = self.store.get(&key).ok()??;
                let entry: CachedEntry = serde_json::from_str(&raw).ok()?;
                Some((key, entry.cached_at))
            })
            .collect();
        aged.sort_by_key(|(_, cached_at)| *cached_at);

        for (key, _) in aged.into_iter().take(count) {
            if self.store.remove(&key).is_ok() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enforce_entry_limit(&self) {
        let keys = self.cache_keys();
        if keys.len() > self.config.max_entries {
            let excess = keys.len() - self.config.max_entries;
            self.evict_oldest(excess);
        }
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use valo_protocol::{SessionView, ValuationRange, ValuationResult, ValueMap};

    use crate::cache::store::MemoryStore;

    fn cache() -> (Arc<MemoryStore>, SessionCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone(), SessionCacheConfig::default());
        (store, cache)
    }

    fn session(report_id: &str) -> ValuationSession {
        ValuationSession::new_local(report_id, SessionView::Manual, ValueMap::new())
    }

    fn completed(report_id: &str) -> ValuationSession {
        let mut s = session(report_id);
        s.valuation_result = Some(ValuationResult {
            valuation_id: "val_123".to_string(),
            equity_value: 2_500_000,
            valuation_range: ValuationRange { min: 2_000_000, max: 3_000_000 },
            confidence_score: 0.85,
            methodology: "DCF + Market Multiples".to_string(),
            details: ValueMap::new(),
        });
        s
    }

    /// Write an entry with a back-dated `cached_at`, as if time had passed.
    fn write_aged(
        store: &MemoryStore,
        cache: &SessionCache,
        session: &ValuationSession,
        age: Duration,
        ttl: Duration,
    ) {
        let cached_at = Utc::now() - delta(age);
        let entry = CachedEntry {
            session: session.stripped_for_cache(),
            cached_at,
            expires_at: cached_at + delta(ttl),
            version: session.version(),
        };
        let key = cache.storage_key(&session.report_id);
        store
            .set(&key, &serde_json::to_string(&entry).expect("serialize"))
            .expect("store");
    }

    #[test]
    fn set_then_get_round_trips_without_large_artifacts() {
        let (_, cache) = cache();
        let mut s = session("val_1");
        s.partial_data.insert("revenue", 1_000_000.0);
        s.report_html = Some("<html>big</html>".to_string());

        cache.set("val_1", &s).expect("set");
        let got = cache.get("val_1").expect("hit");

        assert_eq!(got.report_html, None, "large artifacts are stripped");
        assert_eq!(got.partial_data, s.partial_data);
        assert_eq!(got.session_id, s.session_id);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn set_rejects_invalid_sessions() {
        let (_, cache) = cache();
        let mut s = session("val_1");
        s.session_id = String::new();
        let error = cache.set("val_1", &s).expect_err("must fail validation");
        assert_eq!(error.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn expired_entries_are_purged_on_read() {
        let (store, cache) = cache();
        let s = completed("val_1");
        // TTL shorter than the age: entry is past its expiry.
        write_aged(&store, &cache, &s, Duration::from_secs(60), Duration::from_secs(30));

        assert_eq!(cache.get("val_1"), None);
        assert!(store.get(&cache.storage_key("val_1")).expect("get").is_none());
    }

    #[test]
    fn stale_incomplete_entries_are_purged() {
        let (store, cache) = cache();
        let s = session("val_1");
        write_aged(
            &store,
            &cache,
            &s,
            Duration::from_secs(15 * 60),
            Duration::from_secs(24 * 60 * 60),
        );

        assert_eq!(cache.get("val_1"), None, "15-minute-old incomplete entry must not serve");
        assert!(store.get(&cache.storage_key("val_1")).expect("get").is_none());
    }

    #[test]
    fn stale_complete_entries_still_serve() {
        let (store, cache) = cache();
        let s = completed("val_1");
        write_aged(
            &store,
            &cache,
            &s,
            Duration::from_secs(15 * 60),
            Duration::from_secs(24 * 60 * 60),
        );

        let got = cache.get("val_1").expect("complete entries outlive the staleness window");
        assert!(got.is_complete());
    }

    #[test]
    fn corrupt_entries_are_deleted_misses() {
        let (store, cache) = cache();
        store
            .set(&cache.storage_key("val_1"), "{not json")
            .expect("store");

        assert_eq!(cache.get("val_1"), None);
        assert!(store.get(&cache.storage_key("val_1")).expect("get").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn set_if_newer_refuses_stale_writes() {
        let (_, cache) = cache();
        let mut newer = session("val_1");
        newer.updated_at = Utc::now();
        let mut older = newer.clone();
        older.updated_at = newer.updated_at - TimeDelta::seconds(30);
        older.session_id = "sess_stale".to_string();

        cache.set("val_1", &newer).expect("set");
        let written = cache.set_if_newer("val_1", &older).expect("compare");
        assert!(!written, "older version must not overwrite");

        let got = cache.get("val_1").expect("hit");
        assert_eq!(got.session_id, newer.session_id);
    }

    #[test]
    fn quota_pressure_degrades_to_minimal_entry() {
        // Quota fits one minimal entry but not a payload-heavy one.
        let store = Arc::new(MemoryStore::with_quota(700));
        let cache = SessionCache::new(store.clone(), SessionCacheConfig::default());

        let mut s = session("val_1");
        for i in 0..50 {
            s.partial_data.insert(format!("field_{i}"), "x".repeat(40));
        }

        cache.set("val_1", &s).expect("set never propagates storage failure");

        let got = cache.get("val_1").expect("minimal entry written");
        assert!(got.partial_data.is_empty(), "payload dropped in minimal entry");
        assert_eq!(got.report_id, "val_1");
        assert_eq!(got.session_id, s.session_id);
    }

    #[test]
    fn entry_count_bound_evicts_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionCacheConfig {
            max_entries: 3,
            ..SessionCacheConfig::default()
        };
        let cache = SessionCache::new(store.clone(), config);

        // Four entries, the first one back-dated far enough to be oldest.
        let old = completed("val_old");
        write_aged(
            &store,
            &cache,
            &old,
            Duration::from_secs(60 * 60),
            Duration::from_secs(24 * 60 * 60),
        );
        for id in ["val_1", "val_2", "val_3"] {
            cache.set(id, &completed(id)).expect("set");
        }

        assert_eq!(cache.get("val_old"), None, "oldest entry evicted");
        assert!(cache.get("val_3").is_some());
    }

    #[test]
    fn clean_expired_sweeps_everything_dead() {
        let (store, cache) = cache();
        write_aged(
            &store,
            &cache,
            &completed("val_dead"),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        cache.set("val_live", &completed("val_live")).expect("set");
        store.set(&cache.storage_key("val_junk"), "garbage").expect("store");

        assert_eq!(cache.clean_expired(), 2);
        assert!(cache.get("val_live").is_some());
    }

    #[test]
    fn has_reflects_presence() {
        let (_, cache) = cache();
        assert!(!cache.has("val_1"));
        cache.set("val_1", &session("val_1")).expect("set");
        assert!(cache.has("val_1"));
        cache.delete("val_1");
        assert!(!cache.has("val_1"));
    }
}
