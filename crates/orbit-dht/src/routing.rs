//! Kademlia routing table.
//!
//! 256 k-buckets indexed by shared-prefix length with the local id. Full
//! buckets push fresh candidates into a per-bucket FIFO replacement cache;
//! evictions promote the oldest cached candidate.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::RwLock;

use orbit_core::NodeId;
use orbit_proto::NodeDescriptor;

use crate::{DEFAULT_BUCKET_SIZE, DEFAULT_CACHE_SIZE};

/// Routing table configuration.
#[derive(Debug, Clone)]
pub struct RoutingTableConfig {
    /// Bucket size (k).
    pub bucket_size: usize,
    /// Replacement cache capacity per bucket.
    pub cache_size: usize,
    /// Seconds without contact before a node is considered stale.
    pub stale_timeout_secs: u64,
}

impl Default for RoutingTableConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            stale_timeout_secs: 3600,
        }
    }
}

/// A tracked peer.
#[derive(Debug, Clone)]
pub struct RoutingNode {
    /// The peer's descriptor.
    pub descriptor: NodeDescriptor,
    /// Last successful contact.
    pub last_seen: Instant,
    /// Consecutive failed contacts.
    pub failures: u32,
}

impl RoutingNode {
    /// Wraps a descriptor as a fresh entry.
    pub fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            descriptor,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// The peer's id.
    pub fn id(&self) -> NodeId {
        self.descriptor.id
    }

    /// Refreshes the last-seen time and clears failures.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    /// Returns true when the entry went stale.
    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        self.last_seen.elapsed().as_secs() > timeout_secs
    }
}

/// One k-bucket with its replacement cache.
#[derive(Debug)]
pub struct KBucket {
    nodes: VecDeque<RoutingNode>,
    replacement_cache: VecDeque<RoutingNode>,
    bucket_size: usize,
    cache_size: usize,
}

impl KBucket {
    /// Creates an empty bucket.
    pub fn new(bucket_size: usize, cache_size: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(bucket_size),
            replacement_cache: VecDeque::with_capacity(cache_size),
            bucket_size,
            cache_size,
        }
    }

    /// Number of active nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no active nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when the bucket holds `bucket_size` nodes.
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.bucket_size
    }

    /// Iterates active nodes, least recently seen first.
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.iter()
    }

    /// Snapshot of the replacement cache, oldest first.
    pub fn cached(&self) -> Vec<NodeId> {
        self.replacement_cache.iter().map(|n| n.id()).collect()
    }

    /// Returns a node by id.
    pub fn get(&self, id: &NodeId) -> Option<&RoutingNode> {
        self.nodes.iter().find(|n| n.id() == *id)
    }

    /// Returns a mutable node by id.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut RoutingNode> {
        self.nodes.iter_mut().find(|n| n.id() == *id)
    }

    /// Adds or refreshes a node.
    ///
    /// Known nodes move to the most-recently-seen end. When the bucket is
    /// full the candidate goes to the replacement cache instead (FIFO,
    /// oldest evicted on overflow) and `false` is returned.
    pub fn insert(&mut self, entry: RoutingNode) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id() == entry.id()) {
            let mut existing = self.nodes.remove(pos).expect("position just found");
            existing.touch();
            existing.descriptor = entry.descriptor;
            self.nodes.push_back(existing);
            return true;
        }

        if !self.is_full() {
            self.nodes.push_back(entry);
            return true;
        }

        if let Some(pos) = self
            .replacement_cache
            .iter()
            .position(|n| n.id() == entry.id())
        {
            self.replacement_cache.remove(pos);
        }
        if self.replacement_cache.len() >= self.cache_size {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(entry);
        false
    }

    /// Removes a node, promoting the oldest cached candidate if possible.
    pub fn remove(&mut self, id: &NodeId) -> Option<RoutingNode> {
        let pos = self.nodes.iter().position(|n| n.id() == *id)?;
        let removed = self.nodes.remove(pos).expect("position just found");

        if let Some(replacement) = self.replacement_cache.pop_front() {
            self.nodes.push_back(replacement);
        }

        Some(removed)
    }

    /// Evicts stale nodes and backfills from the replacement cache.
    pub fn evict_stale(&mut self, timeout_secs: u64) -> Vec<RoutingNode> {
        let mut evicted = Vec::new();

        self.nodes.retain(|n| {
            if n.is_stale(timeout_secs) {
                evicted.push(n.clone());
                false
            } else {
                true
            }
        });

        while self.nodes.len() < self.bucket_size {
            match self.replacement_cache.pop_front() {
                Some(replacement) if !replacement.is_stale(timeout_secs) => {
                    self.nodes.push_back(replacement);
                }
                Some(_) => {}
                None => break,
            }
        }

        evicted
    }
}

/// The full routing table.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
    config: RoutingTableConfig,
}

impl RoutingTable {
    /// Creates a routing table for `local_id`.
    pub fn new(local_id: NodeId, config: RoutingTableConfig) -> Self {
        let buckets = (0..256)
            .map(|_| RwLock::new(KBucket::new(config.bucket_size, config.cache_size)))
            .collect();

        Self {
            local_id,
            buckets,
            config,
        }
    }

    /// The local node id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Computes the bucket index for an id (None for the local id).
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        if *id == self.local_id {
            return None;
        }
        let distance = NodeId::new(self.local_id.xor_distance(id));
        Some(255 - distance.leading_zeros() as usize)
    }

    /// Adds or refreshes a node; `false` means it went to a cache.
    pub fn insert(&self, descriptor: NodeDescriptor) -> bool {
        match self.bucket_index(&descriptor.id) {
            Some(index) => self.buckets[index].write().insert(RoutingNode::new(descriptor)),
            None => false,
        }
    }

    /// Removes a node.
    pub fn remove(&self, id: &NodeId) -> Option<RoutingNode> {
        let index = self.bucket_index(id)?;
        self.buckets[index].write().remove(id)
    }

    /// Returns a node by id.
    pub fn get(&self, id: &NodeId) -> Option<RoutingNode> {
        let index = self.bucket_index(id)?;
        self.buckets[index].read().get(id).cloned()
    }

    /// Refreshes a node's last-seen time.
    pub fn touch(&self, id: &NodeId) {
        if let Some(index) = self.bucket_index(id) {
            if let Some(entry) = self.buckets[index].write().get_mut(id) {
                entry.touch();
            }
        }
    }

    /// Records a failed contact; nodes past the failure limit are dropped.
    pub fn record_failure(&self, id: &NodeId) {
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let mut bucket = self.buckets[index].write();
        let drop_node = match bucket.get_mut(id) {
            Some(entry) => {
                entry.failures += 1;
                entry.failures >= 3
            }
            None => false,
        };
        if drop_node {
            bucket.remove(id);
        }
    }

    /// Returns the `count` nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<NodeDescriptor> = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.read().nodes() {
                nodes.push(entry.descriptor.clone());
            }
        }

        nodes.sort_by(|a, b| {
            let dist_a = target.xor_distance(&a.id);
            let dist_b = target.xor_distance(&b.id);
            dist_a.cmp(&dist_b)
        });
        nodes.truncate(count);
        nodes
    }

    /// Total active nodes tracked.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    /// True when no nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracked descriptor.
    pub fn all_nodes(&self) -> Vec<NodeDescriptor> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.read().nodes() {
                nodes.push(entry.descriptor.clone());
            }
        }
        nodes
    }

    /// Evicts stale nodes from every bucket.
    pub fn evict_stale(&self) -> Vec<RoutingNode> {
        let mut evicted = Vec::new();
        for bucket in &self.buckets {
            evicted.extend(bucket.write().evict_stale(self.config.stale_timeout_secs));
        }
        evicted
    }

    /// Snapshot of one bucket's replacement cache (tests and diagnostics).
    pub fn cached_in_bucket(&self, id: &NodeId) -> Vec<NodeId> {
        match self.bucket_index(id) {
            Some(index) => self.buckets[index].read().cached(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::NodeAddress;

    fn descriptor(id: NodeId) -> NodeDescriptor {
        NodeDescriptor::new(id, NodeAddress::new("127.0.0.1:7777"))
    }

    fn entry(id: NodeId) -> RoutingNode {
        RoutingNode::new(descriptor(id))
    }

    #[test]
    fn test_bucket_insert_and_update() {
        let mut bucket = KBucket::new(3, 2);

        for i in 0..3u8 {
            let mut id = [0u8; 32];
            id[0] = i;
            assert!(bucket.insert(entry(NodeId::new(id))));
        }
        assert!(bucket.is_full());

        // Re-insert moves an existing node to the fresh end, no growth.
        let mut id = [0u8; 32];
        id[0] = 1;
        assert!(bucket.insert(entry(NodeId::new(id))));
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn test_replacement_cache_fifo_eviction() {
        let mut bucket = KBucket::new(2, 2);

        let n0 = NodeId::new([0x01; 32]);
        let n1 = NodeId::new([0x02; 32]);
        bucket.insert(entry(n0));
        bucket.insert(entry(n1));
        assert!(bucket.is_full());

        let n2 = NodeId::new([0x03; 32]);
        let n3 = NodeId::new([0x04; 32]);
        let n4 = NodeId::new([0x05; 32]);
        assert!(!bucket.insert(entry(n2)));
        assert!(!bucket.insert(entry(n3)));
        assert_eq!(bucket.cached(), vec![n2, n3]);

        // Overflow evicts the oldest cached candidate.
        assert!(!bucket.insert(entry(n4)));
        assert_eq!(bucket.cached(), vec![n3, n4]);
    }

    #[test]
    fn test_remove_promotes_from_cache() {
        let mut bucket = KBucket::new(1, 2);
        let active = NodeId::new([0x01; 32]);
        let cached = NodeId::new([0x02; 32]);
        bucket.insert(entry(active));
        bucket.insert(entry(cached));

        bucket.remove(&active).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.get(&cached).unwrap().id(), cached);
        assert!(bucket.cached().is_empty());
    }

    #[test]
    fn test_bucket_index() {
        let table = RoutingTable::new(NodeId::new([0x00; 32]), RoutingTableConfig::default());

        assert_eq!(table.bucket_index(&NodeId::new([0xFF; 32])), Some(255));

        let mut near = [0x00; 32];
        near[31] = 0x01;
        assert_eq!(table.bucket_index(&NodeId::new(near)), Some(0));

        assert_eq!(table.bucket_index(&NodeId::new([0x00; 32])), None);

        let mut second_byte = [0x00; 32];
        second_byte[1] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::new(second_byte)), Some(247));
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        for _ in 0..50 {
            table.insert(descriptor(NodeId::random()));
        }

        let target = NodeId::random();
        let closest = table.closest(&target, 10);
        assert!(closest.len() <= 10);
        for i in 1..closest.len() {
            let prev = target.xor_distance(&closest[i - 1].id);
            let curr = target.xor_distance(&closest[i].id);
            assert!(prev <= curr);
        }
    }

    #[test]
    fn test_failures_drop_node() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        let id = NodeId::random();
        table.insert(descriptor(id));

        table.record_failure(&id);
        table.record_failure(&id);
        assert!(table.get(&id).is_some());
        table.record_failure(&id);
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn test_touch_resets_failures() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        let id = NodeId::random();
        table.insert(descriptor(id));

        table.record_failure(&id);
        table.touch(&id);
        assert_eq!(table.get(&id).unwrap().failures, 0);
    }

    #[test]
    fn test_all_nodes() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        let mut inserted = Vec::new();
        for _ in 0..20 {
            let id = NodeId::random();
            table.insert(descriptor(id));
            inserted.push(id);
        }

        let all = table.all_nodes();
        assert_eq!(all.len(), 20);
        for id in inserted {
            assert!(all.iter().any(|d| d.id == id));
        }
    }
}
