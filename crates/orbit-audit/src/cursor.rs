//! Audit cursor: picks the next random stripe to verify.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use orbit_core::ApiKey;
use orbit_pointerdb::{ListRequest, PointerDb};
use orbit_proto::{PayerBandwidthAllocation, Pointer, SignedMessage};

use crate::AuditError;

/// A stripe selected for audit.
#[derive(Debug, Clone)]
pub struct Stripe {
    /// Stripe index within the segment.
    pub index: i64,
    /// Path of the audited pointer.
    pub path: String,
    /// The audited pointer.
    pub pointer: Pointer,
    /// GET allocation for share downloads.
    pub payer: PayerBandwidthAllocation,
    /// Authorization for share downloads.
    pub authorization: SignedMessage,
}

/// Walks the pointer space, remembering where the last page ended.
pub struct AuditCursor {
    pointers: Arc<PointerDb>,
    api_key: ApiKey,
    last_path: Mutex<String>,
}

impl AuditCursor {
    /// Creates a cursor at the beginning of the pointer space.
    pub fn new(pointers: Arc<PointerDb>, api_key: ApiKey) -> Self {
        Self {
            pointers,
            api_key,
            last_path: Mutex::new(String::new()),
        }
    }

    /// Returns a random stripe from the next page of pointers.
    ///
    /// Returns `None` when the page is empty or the sampled pointer is not
    /// a non-empty remote segment; the caller just ticks again.
    pub async fn next_stripe(&self) -> Result<Option<Stripe>, AuditError> {
        let start_after = self.last_path.lock().clone();

        let (items, more) = self.pointers.list(
            &self.api_key,
            &ListRequest {
                start_after,
                recursive: true,
                ..Default::default()
            },
        )?;

        if items.is_empty() {
            // Exhausted the pointer space; wrap around.
            *self.last_path.lock() = String::new();
            return Ok(None);
        }

        {
            let mut last = self.last_path.lock();
            *last = if more {
                items.last().expect("page is non-empty").path.clone()
            } else {
                String::new()
            };
        }

        let picked = &items[rand::thread_rng().gen_range(0..items.len())];
        let result = self.pointers.get(&self.api_key, &picked.path)?;

        let Some(segment) = result.pointer.remote_segment() else {
            return Ok(None);
        };
        if result.pointer.segment_size == 0 {
            return Ok(None);
        }

        let stripe_size = segment.redundancy.stripe_size() as i64;
        // The last partial stripe is skipped; short segments audit stripe 0.
        let index = if result.pointer.segment_size < stripe_size {
            0
        } else {
            rand::thread_rng().gen_range(0..result.pointer.segment_size / stripe_size)
        };

        debug!(path = %picked.path, index, "selected audit stripe");
        Ok(Some(Stripe {
            index,
            path: picked.path.clone(),
            pointer: result.pointer,
            payer: result.payer,
            authorization: result.authorization,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::{Keypair, NodeId, PieceId, Timestamp};
    use orbit_kv::MemoryStore;
    use orbit_overlay::OverlayCache;
    use orbit_pointerdb::PointerDbConfig;
    use orbit_proto::{RedundancyScheme, RemotePiece, RemoteSegment};

    fn pointer_db(api_key: &ApiKey) -> Arc<PointerDb> {
        Arc::new(PointerDb::new(
            Arc::new(MemoryStore::new()),
            Arc::new(OverlayCache::new(Arc::new(MemoryStore::new()))),
            PointerDbConfig {
                api_key: api_key.clone(),
                min_remote_segment_size: 1,
                attach_nodes: false,
                ..Default::default()
            },
            Arc::new(Keypair::generate()),
            NodeId::random(),
        ))
    }

    fn remote_pointer(segment_size: i64) -> Pointer {
        Pointer::remote(
            RemoteSegment {
                piece_id: PieceId::random(),
                redundancy: RedundancyScheme {
                    required: 2,
                    repair: 3,
                    optimal: 3,
                    total: 4,
                    share_size: 16,
                },
                pieces: (0..4)
                    .map(|i| RemotePiece {
                        piece_num: i,
                        node_id: NodeId::random(),
                    })
                    .collect(),
            },
            segment_size,
            Timestamp::unset(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_empty_space_yields_none_and_resets() {
        let api_key = ApiKey::random();
        let cursor = AuditCursor::new(pointer_db(&api_key), api_key);
        assert!(cursor.next_stripe().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stripe_index_in_range() {
        let api_key = ApiKey::random();
        let db = pointer_db(&api_key);
        db.put(&api_key, "bucket/obj", remote_pointer(160)).unwrap();

        let cursor = AuditCursor::new(db, api_key);
        for _ in 0..20 {
            let stripe = cursor.next_stripe().await.unwrap().unwrap();
            // 160 / (2 * 16) = 5 stripes.
            assert!(stripe.index < 5);
            assert_eq!(stripe.path, "bucket/obj");
        }
    }

    #[tokio::test]
    async fn test_inline_pointers_skipped() {
        let api_key = ApiKey::random();
        let db = pointer_db(&api_key);
        db.put(
            &api_key,
            "bucket/inline",
            Pointer::inline(b"tiny".to_vec(), Timestamp::unset(), Vec::new()),
        )
        .unwrap();

        let cursor = AuditCursor::new(db, api_key);
        assert!(cursor.next_stripe().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_segment_audits_stripe_zero() {
        let api_key = ApiKey::random();
        let db = pointer_db(&api_key);
        db.put(&api_key, "bucket/short", remote_pointer(10)).unwrap();

        let cursor = AuditCursor::new(db, api_key);
        let stripe = cursor.next_stripe().await.unwrap().unwrap();
        assert_eq!(stripe.index, 0);
    }
}
