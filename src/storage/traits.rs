//! Abstract key-value store trait.
//!
//! The duplicate cache and the metrics counters live in an external
//! key-value service. This trait is the contract the node needs from it:
//! - An in-memory backend for tests and embedded use
//! - Network clients (memcached, redis, ...) supplied by the host

use std::time::Duration;

use thiserror::Error;

use crate::error::TransportError;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The value under the key is not an integer counter.
    #[error("Value under '{0}' is not an integer")]
    NotAnInteger(String),

    /// The key is reserved and may not be written by this caller.
    #[error("Key '{0}' is reserved")]
    ReservedKey(String),

    /// Backend error.
    #[error("Store backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<StoreError> for TransportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConnectionError(message) => Self::ConnectionFailed { message },
            other => Self::Store {
                message: other.to_string(),
            },
        }
    }
}

/// Key-value store with expiring entries and integer counters.
///
/// # Safety Considerations
/// - `incr_by` must be atomic per key
/// - Implementations must handle concurrent access safely
pub trait KeyValueStore: Send + Sync {
    /// Get the live value under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Set `key` to `value`, replacing any previous value and expiry.
    /// `ttl = None` keeps the entry until it is deleted.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically add `delta` to the integer counter under `key`, creating
    /// it at zero first if absent. Returns the new value.
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Atomically add one to the counter under `key`.
    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.incr_by(key, 1)
    }

    /// List live keys matching a glob (`*` any run, `?` one character).
    fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Delete `key`. Returns true if a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically remove `key` and return its live value. An update that
    /// lands after the removal starts a fresh entry.
    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}
