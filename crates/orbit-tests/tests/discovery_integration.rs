//! Node discovery feeding the overlay cache.

use std::sync::Arc;
use std::time::Duration;

use orbit_core::NodeId;
use orbit_dht::{DhtConfig, DhtService};
use orbit_kv::MemoryStore;
use orbit_net::LocalTransport;
use orbit_overlay::{Discovery, OverlayCache};
use orbit_proto::{NodeAddress, NodeDescriptor};

fn spawn_dht(transport: &LocalTransport) -> Arc<DhtService> {
    let id = NodeId::random();
    let service = Arc::new(DhtService::new(
        NodeDescriptor::new(id, NodeAddress::new("local")),
        DhtConfig::default(),
        Arc::new(transport.clone()),
    ));
    let acceptor = transport.listen(id);
    tokio::spawn(service.clone().serve(acceptor));
    service
}

#[tokio::test]
async fn test_discovery_fills_the_overlay_cache() {
    let transport = LocalTransport::new();

    // A satellite-side DHT plus a handful of storage nodes that bootstrap
    // through it.
    let satellite_dht = spawn_dht(&transport);
    let mut node_ids = Vec::new();
    for _ in 0..4 {
        let node = spawn_dht(&transport);
        node.bootstrap(&[satellite_dht.local().clone()]).await;
        node_ids.push(node.local().id);
    }

    let cache = Arc::new(OverlayCache::new(Arc::new(MemoryStore::new())));
    let discovery = Discovery::new(
        satellite_dht.clone(),
        cache.clone(),
        Duration::from_secs(3600),
    );
    let upserted = discovery.tick().await.unwrap();
    assert!(upserted >= 4, "only {upserted} nodes discovered");

    for id in &node_ids {
        let descriptor = cache.lookup(id).unwrap();
        assert!(descriptor.is_some(), "node {id} missing from the cache");
        assert!(!descriptor.unwrap().last_seen.is_unset());
    }
}

#[tokio::test]
async fn test_rediscovery_preserves_reputation() {
    let transport = LocalTransport::new();
    let satellite_dht = spawn_dht(&transport);
    let node = spawn_dht(&transport);
    node.bootstrap(&[satellite_dht.local().clone()]).await;

    let cache = Arc::new(OverlayCache::new(Arc::new(MemoryStore::new())));
    let discovery = Discovery::new(
        satellite_dht.clone(),
        cache.clone(),
        Duration::from_secs(3600),
    );
    discovery.tick().await.unwrap();

    // Audits write reputation between refreshes.
    let mut stats = cache.get(&node.local().id).unwrap().reputation;
    stats.record_audit(true);
    cache.update_reputation(&node.local().id, stats).unwrap();

    discovery.tick().await.unwrap();
    let stored = cache.get(&node.local().id).unwrap();
    assert_eq!(stored.reputation.audit_count, 1);
}
