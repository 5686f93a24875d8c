//! Durable key-value store boundary.
//!
//! The session cache persists through this trait rather than a concrete
//! backend. The contract mirrors browser local storage: synchronous,
//! string-valued, and bounded by a byte quota — with quota exhaustion
//! reported as its own error variant so callers can react differently
//! to "full" than to "broken".

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded: {attempted} bytes against a {quota}-byte quota")]
    QuotaExceeded { attempted: usize, quota: usize },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Default quota, matching the conventional local-storage allowance.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// In-process store with a byte quota.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes,
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.lock()
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let current: usize = entries
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let attempted = current + key.len() + value.len();
        if attempted > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                attempted,
                quota: self.quota_bytes,
            });
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
