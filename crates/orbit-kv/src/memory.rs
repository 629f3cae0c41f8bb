//! In-memory ordered store for tests and single-process assemblies.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::{KeyValueStore, KvError};

/// BTreeMap-backed store with the same semantics as the RocksDB backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true when the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or(KvError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_keys(&self, first: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, KvError> {
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(first), Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn iterate(
        &self,
        first: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let entries = self.entries.read();
        for (key, value) in entries.range::<[u8], _>((Bound::Included(first), Bound::Unbounded)) {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }
}
