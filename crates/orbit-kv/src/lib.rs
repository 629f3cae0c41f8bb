//! Orbit KV - Ordered key-value store abstraction.
//!
//! Byte keys in lexicographic order with range scans. The pointer service,
//! overlay cache, statistics store, repair queue, and the node-local piece
//! database all sit on this interface, so tests can swap the RocksDB backend
//! for the in-memory one without changing semantics.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod listing;
pub mod memory;
pub mod rocks;

pub use listing::{list_v2, ListItem, ListOptions};
pub use memory::MemoryStore;
pub use rocks::RocksStore;

use thiserror::Error;

/// Maximum items a single paged lookup may return.
pub const LOOKUP_LIMIT: usize = 1000;

/// Hierarchical delimiter used by collapsed listings.
pub const DELIMITER: u8 = b'/';

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key does not exist.
    #[error("key not found")]
    NotFound,

    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered byte-key/byte-value store.
///
/// Callers are serialized by the store's own locking; iterate callbacks must
/// not mutate the store under iteration.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, or [`KvError::NotFound`].
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;

    /// Returns up to `limit` keys starting at the first key `>= first`.
    fn list_keys(&self, first: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, KvError>;

    /// Visits `(key, value)` pairs in ascending key order starting at the
    /// first key `>= first`. The callback returns `false` to stop.
    fn iterate(
        &self,
        first: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError>;
}
