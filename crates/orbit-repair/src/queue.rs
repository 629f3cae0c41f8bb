//! FIFO repair queue on the ordered store.
//!
//! Entries are keyed by a monotonic sequence number for FIFO order, with a
//! per-path index making re-enqueues idempotent while an entry is pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, Timestamp};
use orbit_kv::{KeyValueStore, KvError};

use crate::RepairError;

const QUEUE_PREFIX: &str = "repair/q/";
const PATH_PREFIX: &str = "repair/p/";

/// A segment needing reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjuredSegment {
    /// Pointer path of the injured segment.
    pub path: String,
    /// Piece numbers that were lost.
    pub lost_pieces: Vec<u32>,
}

impl CanonicalEncode for InjuredSegment {
    fn encode(&self, buf: &mut BytesMut) {
        self.path.encode(buf);
        self.lost_pieces.encode(buf);
    }
}

impl CanonicalDecode for InjuredSegment {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            path: String::decode(buf)?,
            lost_pieces: Vec::<u32>::decode(buf)?,
        })
    }
}

/// The repair queue.
pub struct RepairQueue {
    store: Arc<dyn KeyValueStore>,
    seq: AtomicU64,
}

impl RepairQueue {
    /// Creates a queue over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(Timestamp::now().as_millis() as u64),
        }
    }

    fn queue_key(seq: u64) -> Vec<u8> {
        format!("{QUEUE_PREFIX}{seq:020}").into_bytes()
    }

    fn path_key(path: &str) -> Vec<u8> {
        format!("{PATH_PREFIX}{path}").into_bytes()
    }

    /// Appends a segment; a segment already pending is left untouched.
    pub fn enqueue(&self, segment: &InjuredSegment) -> Result<(), RepairError> {
        let path_key = Self::path_key(&segment.path);
        match self.store.get(&path_key) {
            Ok(_) => return Ok(()),
            Err(KvError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.store.put(&Self::queue_key(seq), &segment.to_vec())?;
        self.store.put(&path_key, &seq.to_vec())?;
        Ok(())
    }

    /// Pops the oldest entry, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Result<Option<InjuredSegment>, RepairError> {
        let mut found: Option<(Vec<u8>, Vec<u8>)> = None;
        self.store
            .iterate(QUEUE_PREFIX.as_bytes(), &mut |key, value| {
                if key.starts_with(QUEUE_PREFIX.as_bytes()) {
                    found = Some((key.to_vec(), value.to_vec()));
                }
                false
            })?;

        let Some((key, value)) = found else {
            return Ok(None);
        };

        let segment = InjuredSegment::from_bytes(&value)
            .map_err(|e| RepairError::CorruptEntry(e.to_string()))?;
        self.store.delete(&key)?;
        self.store.delete(&Self::path_key(&segment.path))?;
        Ok(Some(segment))
    }

    /// Number of pending entries.
    pub fn len(&self) -> Result<usize, RepairError> {
        let mut count = 0usize;
        self.store
            .iterate(QUEUE_PREFIX.as_bytes(), &mut |key, _| {
                if !key.starts_with(QUEUE_PREFIX.as_bytes()) {
                    return false;
                }
                count += 1;
                true
            })?;
        Ok(count)
    }

    /// Returns true when nothing is pending.
    pub fn is_empty(&self) -> Result<bool, RepairError> {
        Ok(self.len()? == 0)
    }
}
