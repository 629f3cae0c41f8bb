//! RocksDB-backed ordered store.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, DB};
use tracing::debug;

use crate::{KeyValueStore, KvError};

/// Persistent store backed by RocksDB.
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_allow_concurrent_memtable_write(true);
        opts.set_enable_write_thread_adaptive_yield(true);

        let db = DB::open(&opts, path).map_err(|e| KvError::Database(e.to_string()))?;
        debug!(path = %path.display(), "opened key-value store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Wraps an existing DB handle.
    pub fn with_db(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        match self.db.get(key).map_err(|e| KvError::Database(e.to_string()))? {
            Some(value) => Ok(value),
            None => Err(KvError::NotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.db
            .put(key, value)
            .map_err(|e| KvError::Database(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.db
            .delete(key)
            .map_err(|e| KvError::Database(e.to_string()))
    }

    fn list_keys(&self, first: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, KvError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(first, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter.take(limit) {
            let (key, _) = item.map_err(|e| KvError::Database(e.to_string()))?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn iterate(
        &self,
        first: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(first, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| KvError::Database(e.to_string()))?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.put(b"alpha", b"1").unwrap();
            store.put(b"beta", b"2").unwrap();
            assert_eq!(store.get(b"alpha").unwrap(), b"1");
        }
        {
            let store = RocksStore::open(dir.path()).unwrap();
            assert_eq!(store.get(b"beta").unwrap(), b"2");
            assert!(matches!(store.get(b"gamma"), Err(KvError::NotFound)));
        }
    }

    #[test]
    fn test_ordered_iteration() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for key in [b"c".as_ref(), b"a", b"b"] {
            store.put(key, key).unwrap();
        }

        let mut seen = Vec::new();
        store
            .iterate(b"", &mut |key, _| {
                seen.push(key.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let keys = store.list_keys(b"b", 5).unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
