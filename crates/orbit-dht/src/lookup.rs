//! Iterative alpha-parallel node lookup.
//!
//! Workers share a distance-ordered priority queue behind a mutex: each
//! pulls the closest un-queried candidate, asks it for neighbors, merges the
//! results, and repeats until the queue is exhausted. Cancellation drains
//! the queue so outstanding workers wind down.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::debug;

use orbit_core::NodeId;
use orbit_proto::NodeDescriptor;

use crate::{DhtError, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE};

/// Lookup parameters.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Concurrent query workers (alpha).
    pub alpha: usize,
    /// Result set size (k).
    pub k: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_BUCKET_SIZE,
        }
    }
}

/// Queries one peer for neighbors close to a target.
#[async_trait]
pub trait NodeQuery: Send + Sync {
    /// Asks `node` for up to k nodes near `target`.
    async fn query(
        &self,
        node: &NodeDescriptor,
        target: NodeId,
    ) -> Result<Vec<NodeDescriptor>, DhtError>;
}

struct Candidate {
    distance: [u8; 32],
    descriptor: NodeDescriptor,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.descriptor.id == other.descriptor.id
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.descriptor.id.cmp(&other.descriptor.id))
    }
}

struct LookupState {
    heap: BinaryHeap<Reverse<Candidate>>,
    seen: HashSet<NodeId>,
    responded: Vec<NodeDescriptor>,
    in_flight: usize,
}

impl LookupState {
    fn enqueue(&mut self, target: &NodeId, descriptor: NodeDescriptor) {
        if self.seen.insert(descriptor.id) {
            self.heap.push(Reverse(Candidate {
                distance: target.xor_distance(&descriptor.id),
                descriptor,
            }));
        }
    }
}

/// Runs an iterative lookup toward `target` from `seeds`.
///
/// Returns the k closest nodes that responded, ordered by distance. Flipping
/// `cancel` drains the queue and returns what was gathered so far.
pub async fn find_node(
    target: NodeId,
    seeds: Vec<NodeDescriptor>,
    query: Arc<dyn NodeQuery>,
    config: LookupConfig,
    cancel: watch::Receiver<bool>,
) -> Vec<NodeDescriptor> {
    let state = Arc::new(Mutex::new(LookupState {
        heap: BinaryHeap::new(),
        seen: HashSet::new(),
        responded: Vec::new(),
        in_flight: 0,
    }));
    let wakeup = Arc::new(Notify::new());

    {
        let mut st = state.lock();
        for seed in seeds {
            st.enqueue(&target, seed);
        }
    }

    let mut workers = JoinSet::new();
    for worker_id in 0..config.alpha.max(1) {
        let state = state.clone();
        let wakeup = wakeup.clone();
        let query = query.clone();
        let mut cancel = cancel.clone();

        workers.spawn(async move {
            enum Step {
                Work(NodeDescriptor),
                Done,
                Wait,
            }

            loop {
                if *cancel.borrow() {
                    state.lock().heap.clear();
                    return;
                }

                // Register for wakeups before inspecting the queue, so a
                // peer finishing between the check and the wait is not lost.
                let notified = wakeup.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let step = {
                    let mut st = state.lock();
                    match st.heap.pop() {
                        Some(Reverse(candidate)) => {
                            st.in_flight += 1;
                            Step::Work(candidate.descriptor)
                        }
                        None if st.in_flight == 0 => Step::Done,
                        None => Step::Wait,
                    }
                };

                match step {
                    Step::Work(node) => {
                        let result = query.query(&node, target).await;
                        {
                            let mut st = state.lock();
                            st.in_flight -= 1;
                            match result {
                                Ok(neighbors) => {
                                    st.responded.push(node.clone());
                                    for neighbor in neighbors {
                                        st.enqueue(&target, neighbor);
                                    }
                                }
                                Err(err) => {
                                    debug!(worker_id, node = %node.id, error = %err, "lookup query failed");
                                }
                            }
                        }
                        wakeup.notify_waiters();
                    }
                    Step::Done => {
                        // Wake any peers parked on an empty queue so they
                        // can observe completion too.
                        wakeup.notify_waiters();
                        return;
                    }
                    Step::Wait => {
                        tokio::select! {
                            _ = notified => {}
                            _ = cancel.changed() => {}
                        }
                    }
                }
            }
        });
    }

    while workers.join_next().await.is_some() {}

    let mut responded = {
        let mut st = state.lock();
        std::mem::take(&mut st.responded)
    };
    responded.sort_by(|a, b| {
        target
            .xor_distance(&a.id)
            .cmp(&target.xor_distance(&b.id))
    });
    responded.dedup_by_key(|d| d.id);
    responded.truncate(config.k);
    responded
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::NodeAddress;
    use std::collections::HashMap;

    fn descriptor(id: NodeId) -> NodeDescriptor {
        NodeDescriptor::new(id, NodeAddress::new("127.0.0.1:0"))
    }

    /// Static network: every node knows its listed neighbors.
    struct FakeNetwork {
        neighbors: HashMap<NodeId, Vec<NodeDescriptor>>,
    }

    #[async_trait]
    impl NodeQuery for FakeNetwork {
        async fn query(
            &self,
            node: &NodeDescriptor,
            _target: NodeId,
        ) -> Result<Vec<NodeDescriptor>, DhtError> {
            self.neighbors
                .get(&node.id)
                .cloned()
                .ok_or_else(|| DhtError::QueryFailed("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_lookup_walks_the_network() {
        // a -> b -> c; starting from a the lookup must reach c.
        let a = descriptor(NodeId::new([0x10; 32]));
        let b = descriptor(NodeId::new([0x20; 32]));
        let c = descriptor(NodeId::new([0x30; 32]));

        let mut neighbors = HashMap::new();
        neighbors.insert(a.id, vec![b.clone()]);
        neighbors.insert(b.id, vec![c.clone()]);
        neighbors.insert(c.id, vec![]);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let found = find_node(
            NodeId::new([0x31; 32]),
            vec![a.clone()],
            Arc::new(FakeNetwork { neighbors }),
            LookupConfig { alpha: 2, k: 10 },
            cancel_rx,
        )
        .await;

        let ids: Vec<NodeId> = found.iter().map(|d| d.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert!(ids.contains(&c.id));
    }

    #[tokio::test]
    async fn test_lookup_orders_by_distance_and_truncates() {
        let target = NodeId::new([0x00; 32]);
        let near = descriptor(NodeId::new([0x01; 32]));
        let mid = descriptor(NodeId::new([0x0F; 32]));
        let far = descriptor(NodeId::new([0xF0; 32]));

        let mut neighbors = HashMap::new();
        neighbors.insert(near.id, vec![]);
        neighbors.insert(mid.id, vec![]);
        neighbors.insert(far.id, vec![]);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let found = find_node(
            target,
            vec![far.clone(), near.clone(), mid.clone()],
            Arc::new(FakeNetwork { neighbors }),
            LookupConfig { alpha: 3, k: 2 },
            cancel_rx,
        )
        .await;

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, near.id);
        assert_eq!(found[1].id, mid.id);
    }

    #[tokio::test]
    async fn test_unreachable_nodes_are_skipped() {
        let alive = descriptor(NodeId::new([0x01; 32]));
        let dead = descriptor(NodeId::new([0x02; 32]));

        let mut neighbors = HashMap::new();
        neighbors.insert(alive.id, vec![dead.clone()]);
        // `dead` is not in the map and fails every query.

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let found = find_node(
            NodeId::new([0x03; 32]),
            vec![alive.clone()],
            Arc::new(FakeNetwork { neighbors }),
            LookupConfig::default(),
            cancel_rx,
        )
        .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, alive.id);
    }

    #[tokio::test]
    async fn test_cancellation_drains_the_queue() {
        // Build a long chain so the lookup has plenty of work.
        let mut neighbors: HashMap<NodeId, Vec<NodeDescriptor>> = HashMap::new();
        let mut chain = Vec::new();
        for i in 0..64u8 {
            let mut id = [0u8; 32];
            id[0] = i + 1;
            chain.push(descriptor(NodeId::new(id)));
        }
        for pair in chain.windows(2) {
            neighbors.insert(pair[0].id, vec![pair[1].clone()]);
        }
        neighbors.insert(chain.last().unwrap().id, vec![]);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let found = find_node(
            NodeId::new([0xFF; 32]),
            vec![chain[0].clone()],
            Arc::new(FakeNetwork { neighbors }),
            LookupConfig { alpha: 1, k: 64 },
            cancel_rx,
        )
        .await;

        // Canceled before any queries completed.
        assert!(found.is_empty());
    }
}
