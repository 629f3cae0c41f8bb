//! Audit and uptime statistics store.

use std::sync::Arc;

use orbit_core::{CanonicalDecode, CanonicalEncode, NodeId};
use orbit_kv::{KeyValueStore, KvError};
use orbit_proto::NodeStats;
use tracing::warn;

use crate::OverlayError;

const STATS_PREFIX: &str = "stats/";

/// One statistics update for a node.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateRequest {
    /// Node being updated.
    pub node_id: NodeId,
    /// Audit outcome to record, if the event included one.
    pub audit: Option<bool>,
    /// Uptime outcome to record, if the event included one.
    pub uptime: Option<bool>,
    /// Observed latency sample in milliseconds.
    pub latency: Option<i64>,
}

impl UpdateRequest {
    /// Update recording a passed audit (implies the node was online).
    pub fn audit_success(node_id: NodeId) -> Self {
        Self {
            node_id,
            audit: Some(true),
            uptime: Some(true),
            ..Default::default()
        }
    }

    /// Update recording a failed audit by an online node.
    pub fn audit_failure(node_id: NodeId) -> Self {
        Self {
            node_id,
            audit: Some(false),
            uptime: Some(true),
            ..Default::default()
        }
    }

    /// Update recording an offline node.
    pub fn offline(node_id: NodeId) -> Self {
        Self {
            node_id,
            uptime: Some(false),
            ..Default::default()
        }
    }
}

/// Per-node reputation counters, persisted on the ordered store.
pub struct StatDb {
    store: Arc<dyn KeyValueStore>,
}

impl StatDb {
    /// Creates a statistics store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(id: &NodeId) -> Vec<u8> {
        format!("{STATS_PREFIX}{}", id.to_hex()).into_bytes()
    }

    /// Creates a node's record; fails if one already exists.
    pub fn create(
        &self,
        id: &NodeId,
        initial: Option<NodeStats>,
    ) -> Result<NodeStats, OverlayError> {
        if self.store.get(&Self::key(id)).is_ok() {
            return Err(OverlayError::AlreadyExists);
        }
        let stats = initial.unwrap_or_default();
        self.store.put(&Self::key(id), &stats.to_vec())?;
        Ok(stats)
    }

    /// Creates an empty record when the node is new; a no-op otherwise.
    pub fn create_if_not_exists(&self, id: &NodeId) -> Result<(), OverlayError> {
        match self.create(id, None) {
            Ok(_) | Err(OverlayError::AlreadyExists) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Returns a node's statistics.
    pub fn get(&self, id: &NodeId) -> Result<NodeStats, OverlayError> {
        match self.store.get(&Self::key(id)) {
            Ok(raw) => {
                NodeStats::from_bytes(&raw).map_err(|e| OverlayError::CorruptRecord(e.to_string()))
            }
            Err(KvError::NotFound) => Err(OverlayError::NodeNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies one update, recomputing ratios, and returns the new record.
    pub fn update(&self, request: &UpdateRequest) -> Result<NodeStats, OverlayError> {
        let mut stats = self.get(&request.node_id)?;
        if let Some(success) = request.audit {
            stats.record_audit(success);
        }
        if let Some(online) = request.uptime {
            stats.record_uptime(online);
        }
        if let Some(latency) = request.latency {
            stats.latency_90 = latency;
        }
        self.store.put(&Self::key(&request.node_id), &stats.to_vec())?;
        Ok(stats)
    }

    /// Applies a batch of updates.
    ///
    /// Each node commits independently; nodes whose update failed are
    /// returned without aborting the rest of the batch.
    pub fn update_batch(
        &self,
        requests: &[UpdateRequest],
    ) -> Result<(Vec<NodeStats>, Vec<NodeId>), OverlayError> {
        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for request in requests {
            if self.create_if_not_exists(&request.node_id).is_err() {
                failed.push(request.node_id);
                continue;
            }
            match self.update(request) {
                Ok(stats) => updated.push(stats),
                Err(err) => {
                    warn!(node_id = %request.node_id, error = %err, "stats update failed");
                    failed.push(request.node_id);
                }
            }
        }
        Ok((updated, failed))
    }

    /// Returns the subset of `ids` whose records meet `min`.
    pub fn find_valid_nodes(
        &self,
        ids: &[NodeId],
        min: &NodeStats,
    ) -> Result<Vec<NodeId>, OverlayError> {
        let mut passed = Vec::new();
        for id in ids {
            match self.get(id) {
                Ok(stats) if stats.meets(min) => passed.push(*id),
                Ok(_) | Err(OverlayError::NodeNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_kv::MemoryStore;

    fn db() -> StatDb {
        StatDb::new(Arc::new(MemoryStore::new()))
    }

    fn seeded(db: &StatDb, audit: (i64, i64), uptime: (i64, i64)) -> NodeId {
        let id = NodeId::random();
        db.create(
            &id,
            Some(NodeStats {
                audit_success_count: audit.0,
                audit_count: audit.1,
                audit_ratio: audit.0 as f64 / audit.1.max(1) as f64,
                uptime_success_count: uptime.0,
                uptime_count: uptime.1,
                uptime_ratio: uptime.0 as f64 / uptime.1.max(1) as f64,
                latency_90: 0,
            }),
        )
        .unwrap();
        id
    }

    #[test]
    fn test_create_and_duplicate() {
        let db = db();
        let id = NodeId::random();

        let stats = db.create(&id, None).unwrap();
        assert_eq!(stats.audit_ratio, 0.0);
        assert_eq!(stats.uptime_ratio, 0.0);

        assert!(matches!(
            db.create(&id, None),
            Err(OverlayError::AlreadyExists)
        ));
        db.create_if_not_exists(&id).unwrap();
    }

    #[test]
    fn test_get_missing() {
        let db = db();
        assert!(matches!(
            db.get(&NodeId::random()),
            Err(OverlayError::NodeNotFound)
        ));
    }

    #[test]
    fn test_update_recomputes_ratios() {
        let db = db();
        let id = seeded(&db, (4, 10), (8, 25));

        // One successful audit plus one offline observation.
        db.update(&UpdateRequest {
            node_id: id,
            audit: Some(true),
            uptime: None,
            latency: None,
        })
        .unwrap();
        let stats = db
            .update(&UpdateRequest {
                node_id: id,
                uptime: Some(false),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(stats.audit_success_count, 5);
        assert_eq!(stats.audit_count, 11);
        assert_eq!(stats.uptime_success_count, 8);
        assert_eq!(stats.uptime_count, 26);
        assert!((stats.audit_ratio - 5.0 / 11.0).abs() < 1e-9);
        assert!((stats.uptime_ratio - 8.0 / 26.0).abs() < 1e-9);
    }

    #[test]
    fn test_find_valid_nodes() {
        let db = db();
        let bad_ratios = seeded(&db, (10, 20), (10, 20));
        let good = seeded(&db, (20, 20), (20, 20));
        let bad_uptime = seeded(&db, (20, 20), (10, 20));
        let bad_audit = seeded(&db, (10, 20), (20, 20));
        let too_few_audits = seeded(&db, (5, 5), (5, 5));
        let borderline = seeded(&db, (19, 20), (19, 20));

        let min = NodeStats {
            audit_count: 15,
            audit_ratio: 0.95,
            uptime_ratio: 0.95,
            ..Default::default()
        };
        let passed = db
            .find_valid_nodes(
                &[bad_ratios, good, bad_uptime, bad_audit, too_few_audits, borderline],
                &min,
            )
            .unwrap();

        assert_eq!(passed, vec![good, borderline]);
    }

    #[test]
    fn test_batch_reports_failures_without_aborting() {
        let db = db();
        let known = seeded(&db, (1, 1), (1, 1));
        let unknown = NodeId::random();

        let (updated, failed) = db
            .update_batch(&[
                UpdateRequest::audit_success(known),
                UpdateRequest::audit_failure(unknown),
            ])
            .unwrap();

        // Unknown nodes are created on the fly by batch updates.
        assert_eq!(updated.len(), 2);
        assert!(failed.is_empty());
        assert_eq!(db.get(&known).unwrap().audit_count, 2);
        assert_eq!(db.get(&unknown).unwrap().audit_count, 1);
        assert_eq!(db.get(&unknown).unwrap().audit_success_count, 0);
    }

    #[test]
    fn test_latency_sample_recorded() {
        let db = db();
        let id = seeded(&db, (0, 0), (0, 0));
        let stats = db
            .update(&UpdateRequest {
                node_id: id,
                latency: Some(42),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stats.latency_90, 42);
    }
}
