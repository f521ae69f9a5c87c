//! Duplicate/update detection.
//!
//! A live cache entry under a data id means the id was already announced.
//! Entries are written after every successful publish and expire on their
//! own; an expired entry makes the next publish look new again.
//!
//! Within one process the read (`seen`) and write (`remember`) for a data id
//! are serialized by `DuplicateCache::lock`, so two concurrent events for the
//! same file cannot both be classified as new.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::storage::{KeyValueStore, StoreError};

const DEDUP_TAG: &str = "DuplicateCache:";

/// Fingerprint stored as the cache value for a published payload.
#[must_use]
pub fn marker(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

#[derive(Debug, Default)]
struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Exclusive hold on one data id; released on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_all();
    }
}

/// Duplicate cache over an external key-value store.
#[derive(Clone)]
pub struct DuplicateCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    locks: Arc<KeyLocks>,
}

impl std::fmt::Debug for DuplicateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl DuplicateCache {
    /// Creates a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Blocks until no other caller holds `data_id`, then holds it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::BackendError` if the lock table is poisoned.
    pub fn lock(&self, data_id: &str) -> Result<KeyGuard<'_>, StoreError> {
        let poisoned = || StoreError::BackendError("poisoned lock: dedup.lock".to_string());
        let mut held = self.locks.held.lock().map_err(|_| poisoned())?;
        while held.contains(data_id) {
            held = self.locks.released.wait(held).map_err(|_| poisoned())?;
        }
        held.insert(data_id.to_string());
        Ok(KeyGuard {
            locks: &self.locks,
            key: data_id.to_string(),
        })
    }

    /// Returns true if `data_id` has a live entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn seen(&self, data_id: &str) -> Result<bool, StoreError> {
        let seen = self.store.get(data_id)?.is_some();
        trace!("{DEDUP_TAG} {data_id} seen={seen}");
        Ok(seen)
    }

    /// Records (or refreshes) the entry for `data_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn remember(&self, data_id: &str, marker: &str) -> Result<(), StoreError> {
        trace!("{DEDUP_TAG} {data_id} remembered for {:?}", self.ttl);
        self.store.set(data_id, marker.as_bytes(), Some(self.ttl))
    }
}
