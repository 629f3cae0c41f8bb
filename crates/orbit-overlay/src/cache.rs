//! Overlay node cache.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use orbit_core::{CanonicalDecode, CanonicalEncode, NodeId, Timestamp};
use orbit_kv::{KeyValueStore, KvError};
use orbit_proto::{NodeDescriptor, NodeStats};

use crate::OverlayError;

const NODE_PREFIX: &str = "node/";

/// Node selection criteria.
#[derive(Debug, Clone, Default)]
pub struct ChooseOptions {
    /// How many distinct nodes to return.
    pub amount: usize,
    /// Required free space in bytes; 0 means any.
    pub space: i64,
    /// Nodes that must not be selected.
    pub excluded: Vec<NodeId>,
    /// Minimum reputation; `None` accepts any.
    pub min_reputation: Option<NodeStats>,
}

/// The node-id -> descriptor directory.
pub struct OverlayCache {
    store: Arc<dyn KeyValueStore>,
}

impl OverlayCache {
    /// Creates a cache over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(id: &NodeId) -> Vec<u8> {
        format!("{NODE_PREFIX}{}", id.to_hex()).into_bytes()
    }

    /// Looks up a node, failing when it is unknown.
    pub fn get(&self, id: &NodeId) -> Result<NodeDescriptor, OverlayError> {
        if id.is_zero() {
            return Err(OverlayError::EmptyNode);
        }
        match self.store.get(&Self::key(id)) {
            Ok(raw) => NodeDescriptor::from_bytes(&raw)
                .map_err(|e| OverlayError::CorruptRecord(e.to_string())),
            Err(KvError::NotFound) => Err(OverlayError::NodeNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Inserts or replaces a descriptor.
    pub fn put(&self, descriptor: &NodeDescriptor) -> Result<(), OverlayError> {
        if descriptor.id.is_zero() {
            return Err(OverlayError::EmptyNode);
        }
        self.store
            .put(&Self::key(&descriptor.id), &descriptor.to_vec())?;
        Ok(())
    }

    /// Upserts a discovered node, preserving any reputation the cache
    /// already holds (reputation belongs to the statistics store).
    pub fn upsert_discovered(&self, descriptor: &NodeDescriptor) -> Result<(), OverlayError> {
        let mut merged = descriptor.clone();
        merged.last_seen = Timestamp::now();
        merged.unreachable = false;
        if let Ok(existing) = self.get(&descriptor.id) {
            merged.reputation = existing.reputation;
        }
        self.put(&merged)
    }

    /// Writes fresh statistics into a cached descriptor.
    pub fn update_reputation(&self, id: &NodeId, stats: NodeStats) -> Result<(), OverlayError> {
        let mut descriptor = self.get(id)?;
        descriptor.reputation = stats;
        self.put(&descriptor)
    }

    /// Marks a node unreachable without deleting it.
    pub fn mark_unreachable(&self, id: &NodeId) -> Result<(), OverlayError> {
        let mut descriptor = self.get(id)?;
        descriptor.unreachable = true;
        self.put(&descriptor)
    }

    /// Resolves a single node, `None` when unknown.
    pub fn lookup(&self, id: &NodeId) -> Result<Option<NodeDescriptor>, OverlayError> {
        match self.get(id) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(OverlayError::NodeNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Resolves many ids; missing nodes yield `None` at their position.
    pub fn bulk_lookup(
        &self,
        ids: &[NodeId],
    ) -> Result<Vec<Option<NodeDescriptor>>, OverlayError> {
        ids.iter().map(|id| self.lookup(id)).collect()
    }

    /// Returns every cached descriptor.
    pub fn all(&self) -> Result<Vec<NodeDescriptor>, OverlayError> {
        let mut nodes = Vec::new();
        let mut corrupt = None;
        self.store
            .iterate(NODE_PREFIX.as_bytes(), &mut |key, value| {
                if !key.starts_with(NODE_PREFIX.as_bytes()) {
                    return false;
                }
                match NodeDescriptor::from_bytes(value) {
                    Ok(descriptor) => nodes.push(descriptor),
                    Err(err) => {
                        corrupt = Some(err);
                        return false;
                    }
                }
                true
            })?;
        if let Some(err) = corrupt {
            return Err(OverlayError::CorruptRecord(err.to_string()));
        }
        Ok(nodes)
    }

    /// Selects `options.amount` distinct nodes satisfying the criteria.
    pub fn choose(&self, options: &ChooseOptions) -> Result<Vec<NodeDescriptor>, OverlayError> {
        let mut candidates: Vec<NodeDescriptor> = self
            .all()?
            .into_iter()
            .filter(|node| !node.unreachable)
            .filter(|node| !options.excluded.contains(&node.id))
            .filter(|node| {
                // Unknown capacity is not a disqualifier.
                options.space == 0
                    || node.restrictions.free_disk < 0
                    || node.restrictions.free_disk >= options.space
            })
            .filter(|node| {
                options
                    .min_reputation
                    .as_ref()
                    .map_or(true, |min| node.reputation.meets(min))
            })
            .collect();

        if candidates.len() < options.amount {
            return Err(OverlayError::NotEnoughNodes {
                requested: options.amount,
                found: candidates.len(),
            });
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(options.amount);
        Ok(candidates)
    }
}

/// Node selection and resolution capability, implemented by the in-process
/// cache and by remote overlay clients.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    /// Selects distinct nodes satisfying the criteria.
    async fn choose_nodes(
        &self,
        options: &ChooseOptions,
    ) -> Result<Vec<NodeDescriptor>, OverlayError>;

    /// Resolves ids to descriptors, position-preserved.
    async fn lookup_nodes(
        &self,
        ids: &[NodeId],
    ) -> Result<Vec<Option<NodeDescriptor>>, OverlayError>;
}

#[async_trait]
impl NodeSelector for OverlayCache {
    async fn choose_nodes(
        &self,
        options: &ChooseOptions,
    ) -> Result<Vec<NodeDescriptor>, OverlayError> {
        self.choose(options)
    }

    async fn lookup_nodes(
        &self,
        ids: &[NodeId],
    ) -> Result<Vec<Option<NodeDescriptor>>, OverlayError> {
        self.bulk_lookup(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_kv::MemoryStore;
    use orbit_proto::NodeAddress;

    fn cache() -> OverlayCache {
        OverlayCache::new(Arc::new(MemoryStore::new()))
    }

    fn descriptor(id: NodeId) -> NodeDescriptor {
        NodeDescriptor::new(id, NodeAddress::new("127.0.0.1:7777"))
    }

    #[test]
    fn test_get_put_lookup() {
        let cache = cache();
        let id = NodeId::random();

        assert!(matches!(cache.get(&id), Err(OverlayError::NodeNotFound)));
        assert!(cache.lookup(&id).unwrap().is_none());

        cache.put(&descriptor(id)).unwrap();
        assert_eq!(cache.get(&id).unwrap().id, id);
        assert!(cache.lookup(&id).unwrap().is_some());
    }

    #[test]
    fn test_zero_id_rejected() {
        let cache = cache();
        assert!(matches!(
            cache.get(&NodeId::zero()),
            Err(OverlayError::EmptyNode)
        ));
        assert!(matches!(
            cache.put(&descriptor(NodeId::zero())),
            Err(OverlayError::EmptyNode)
        ));
    }

    #[test]
    fn test_bulk_lookup_preserves_positions() {
        let cache = cache();
        let known1 = NodeId::random();
        let missing = NodeId::random();
        let known2 = NodeId::random();
        cache.put(&descriptor(known1)).unwrap();
        cache.put(&descriptor(known2)).unwrap();

        let resolved = cache.bulk_lookup(&[known1, missing, known2]).unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].as_ref().unwrap().id, known1);
        assert!(resolved[1].is_none());
        assert_eq!(resolved[2].as_ref().unwrap().id, known2);
    }

    #[test]
    fn test_choose_excludes_and_counts() {
        let cache = cache();
        let ids: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        for id in &ids {
            cache.put(&descriptor(*id)).unwrap();
        }

        let chosen = cache
            .choose(&ChooseOptions {
                amount: 3,
                excluded: vec![ids[0], ids[1]],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(chosen.len(), 3);
        for node in &chosen {
            assert_eq!(chosen.iter().filter(|n| n.id == node.id).count(), 1);
            assert_ne!(node.id, ids[0]);
            assert_ne!(node.id, ids[1]);
        }

        assert!(matches!(
            cache.choose(&ChooseOptions {
                amount: 4,
                excluded: vec![ids[0], ids[1]],
                ..Default::default()
            }),
            Err(OverlayError::NotEnoughNodes { requested: 4, found: 3 })
        ));
    }

    #[test]
    fn test_choose_filters_unreachable_and_reputation() {
        let cache = cache();

        let good = NodeId::random();
        let mut good_desc = descriptor(good);
        good_desc.reputation.audit_success_count = 20;
        good_desc.reputation.audit_count = 20;
        good_desc.reputation.audit_ratio = 1.0;
        cache.put(&good_desc).unwrap();

        let down = NodeId::random();
        let mut down_desc = descriptor(down);
        down_desc.unreachable = true;
        cache.put(&down_desc).unwrap();

        let unaudited = NodeId::random();
        cache.put(&descriptor(unaudited)).unwrap();

        let min = NodeStats {
            audit_count: 10,
            audit_ratio: 0.9,
            ..Default::default()
        };
        let chosen = cache
            .choose(&ChooseOptions {
                amount: 1,
                min_reputation: Some(min),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(chosen[0].id, good);
    }

    #[test]
    fn test_choose_space_restriction() {
        let cache = cache();

        let small = NodeId::random();
        let mut small_desc = descriptor(small);
        small_desc.restrictions.free_disk = 100;
        cache.put(&small_desc).unwrap();

        let big = NodeId::random();
        let mut big_desc = descriptor(big);
        big_desc.restrictions.free_disk = 1 << 30;
        cache.put(&big_desc).unwrap();

        let chosen = cache
            .choose(&ChooseOptions {
                amount: 1,
                space: 1 << 20,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(chosen[0].id, big);
    }

    #[test]
    fn test_upsert_preserves_reputation() {
        let cache = cache();
        let id = NodeId::random();

        let mut seeded = descriptor(id);
        seeded.reputation.audit_count = 7;
        cache.put(&seeded).unwrap();

        let mut rediscovered = descriptor(id);
        rediscovered.address = NodeAddress::new("10.0.0.9:7777");
        cache.upsert_discovered(&rediscovered).unwrap();

        let stored = cache.get(&id).unwrap();
        assert_eq!(stored.address.address, "10.0.0.9:7777");
        assert_eq!(stored.reputation.audit_count, 7);
        assert!(!stored.last_seen.is_unset());
    }

    #[test]
    fn test_mark_unreachable_keeps_record() {
        let cache = cache();
        let id = NodeId::random();
        cache.put(&descriptor(id)).unwrap();

        cache.mark_unreachable(&id).unwrap();
        assert!(cache.get(&id).unwrap().unreachable);
    }
}
