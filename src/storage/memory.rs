//! In-memory store backend.
//!
//! Thread-safe implementation of `KeyValueStore` with per-entry expiry.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::storage::traits::{KeyValueStore, StoreError};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::BackendError(format!("poisoned lock: {context}"))
}

fn glob_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut literal = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| StoreError::BackendError(format!("invalid scan pattern: {e}")))
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe in-memory key-value store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    skew: Mutex<Duration>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the store's clock forward, expiring entries as if `by` had elapsed.
    pub fn advance(&self, by: Duration) -> Result<(), StoreError> {
        let mut skew = self.skew.lock().map_err(|_| lock_err("store.advance"))?;
        *skew += by;
        Ok(())
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = self.now()?;
        let entries = self.entries.read().map_err(|_| lock_err("store.len"))?;
        Ok(entries.values().filter(|e| e.is_live(now)).count())
    }

    /// Returns true if no live entry remains.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn now(&self) -> Result<Instant, StoreError> {
        let skew = self.skew.lock().map_err(|_| lock_err("store.now"))?;
        Ok(Instant::now() + *skew)
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.now()?;
        let entries = self.entries.read().map_err(|_| lock_err("store.get"))?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.now()?;
        let mut entries = self.entries.write().map_err(|_| lock_err("store.set"))?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.now()?;
        let mut entries = self.entries.write().map_err(|_| lock_err("store.incr_by"))?;

        let (current, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                let text = std::str::from_utf8(&entry.value)
                    .map_err(|_| StoreError::NotAnInteger(key.to_string()))?;
                let value: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| StoreError::NotAnInteger(key.to_string()))?;
                (value, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::BackendError(format!("counter overflow: {key}")))?;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let re = glob_regex(pattern)?;
        let now = self.now()?;
        let entries = self.entries.read().map_err(|_| lock_err("store.scan"))?;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && re.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.now()?;
        let mut entries = self.entries.write().map_err(|_| lock_err("store.delete"))?;
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.now()?;
        let mut entries = self.entries.write().map_err(|_| lock_err("store.take"))?;
        Ok(entries
            .remove(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value))
    }
}
