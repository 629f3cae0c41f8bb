//! Discovery service: keeps the overlay cache fed from the DHT.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use orbit_core::NodeId;
use orbit_proto::NodeDescriptor;

use crate::cache::OverlayCache;
use crate::OverlayError;

/// A source of known nodes, implemented by the Kademlia service.
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Every node currently known to the source.
    fn seen(&self) -> Vec<NodeDescriptor>;

    /// Runs a network lookup toward `target`, returning discovered nodes.
    async fn refresh(&self, target: NodeId) -> Result<Vec<NodeDescriptor>, OverlayError>;
}

/// Periodic cache refresher.
pub struct Discovery {
    source: Arc<dyn NodeSource>,
    cache: Arc<OverlayCache>,
    refresh_interval: Duration,
}

impl Discovery {
    /// Creates a discovery service.
    pub fn new(
        source: Arc<dyn NodeSource>,
        cache: Arc<OverlayCache>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            refresh_interval,
        }
    }

    /// Runs the refresh loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(count) => debug!(count, "discovery refresh"),
                        Err(err) => warn!(error = %err, "discovery refresh failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One refresh pass: upsert everything the DHT has seen, then walk
    /// toward a random target to surface new arrivals.
    pub async fn tick(&self) -> Result<usize, OverlayError> {
        let mut count = 0usize;

        for descriptor in self.source.seen() {
            self.cache.upsert_discovered(&descriptor)?;
            count += 1;
        }

        match self.source.refresh(NodeId::random()).await {
            Ok(found) => {
                for descriptor in found {
                    self.cache.upsert_discovered(&descriptor)?;
                    count += 1;
                }
            }
            Err(err) => warn!(error = %err, "random-target lookup failed"),
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_kv::MemoryStore;
    use orbit_proto::NodeAddress;
    use parking_lot::Mutex;

    struct FakeSource {
        seen: Vec<NodeDescriptor>,
        found: Mutex<Vec<NodeDescriptor>>,
    }

    #[async_trait]
    impl NodeSource for FakeSource {
        fn seen(&self) -> Vec<NodeDescriptor> {
            self.seen.clone()
        }

        async fn refresh(&self, _target: NodeId) -> Result<Vec<NodeDescriptor>, OverlayError> {
            Ok(self.found.lock().drain(..).collect())
        }
    }

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor::new(NodeId::random(), NodeAddress::new("127.0.0.1:0"))
    }

    #[tokio::test]
    async fn test_tick_upserts_seen_and_found() {
        let seen = vec![descriptor(), descriptor()];
        let found = vec![descriptor()];
        let source = Arc::new(FakeSource {
            seen: seen.clone(),
            found: Mutex::new(found.clone()),
        });
        let cache = Arc::new(OverlayCache::new(Arc::new(MemoryStore::new())));

        let discovery = Discovery::new(source, cache.clone(), Duration::from_secs(60));
        let count = discovery.tick().await.unwrap();
        assert_eq!(count, 3);

        for node in seen.iter().chain(found.iter()) {
            assert!(cache.lookup(&node.id).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_second_tick_is_idempotent() {
        let seen = vec![descriptor()];
        let source = Arc::new(FakeSource {
            seen: seen.clone(),
            found: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(OverlayCache::new(Arc::new(MemoryStore::new())));

        let discovery = Discovery::new(source, cache.clone(), Duration::from_secs(60));
        discovery.tick().await.unwrap();
        discovery.tick().await.unwrap();

        assert_eq!(cache.all().unwrap().len(), 1);
    }
}
