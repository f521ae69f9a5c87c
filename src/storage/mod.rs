//! Key-value storage seam.
//!
//! The duplicate cache and metrics counters are external services; the node
//! only talks to them through `KeyValueStore`.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::{KeyValueStore, StoreError};
