//! Repair and audit control loop scenarios.

use tokio::sync::watch;

use orbit_core::ranger::read_all;
use orbit_core::RootKey;
use orbit_core::Timestamp;
use orbit_overlay::UpdateRequest;
use orbit_pointerdb::ListRequest;
use orbit_proto::RemoteSegment;
use orbit_tests::{TestNetwork, TestNetworkConfig};

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

async fn upload(network: &TestNetwork, store: &orbit_pipeline::ObjectStore, data: &[u8]) -> RemoteSegment {
    store
        .put(
            "bucket",
            "obj",
            std::io::Cursor::new(data.to_vec()),
            Vec::new(),
            Timestamp::unset(),
            no_cancel(),
        )
        .await
        .unwrap();

    let (items, _) = network
        .satellite
        .pointers
        .list(
            &network.satellite.api_key,
            &ListRequest {
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();
    let result = network
        .satellite
        .pointers
        .get(&network.satellite.api_key, &items[0].path)
        .unwrap();
    result.pointer.remote_segment().unwrap().clone()
}

#[tokio::test]
async fn test_checker_and_worker_restore_redundancy() {
    let network = TestNetwork::new(TestNetworkConfig {
        nodes: 6,
        ..Default::default()
    })
    .await;
    let store = network.object_store(RootKey::random());
    let data = vec![0xA7u8; 64 * 1024];

    let segment = upload(&network, &store, &data).await;
    assert_eq!(segment.pieces.len(), 4);

    // One piece-holding node dies.
    let victim = segment.pieces[1].node_id;
    network.kill_node(&victim);

    // The checker notices the segment dropped below the repair threshold.
    let checker = network.checker();
    assert_eq!(checker.identify_injured_segments().unwrap(), 1);
    assert_eq!(network.satellite.queue.len().unwrap(), 1);

    // Re-running before the repair does not duplicate the entry.
    assert_eq!(checker.identify_injured_segments().unwrap(), 1);
    assert_eq!(network.satellite.queue.len().unwrap(), 1);

    // The worker reconstructs the lost piece onto a fresh node.
    let worker = network.repair_worker();
    assert_eq!(worker.drain().await.unwrap(), 1);
    assert!(network.satellite.queue.is_empty().unwrap());

    let repaired = upload_pointer(&network);
    assert_eq!(repaired.pieces.len(), 4);
    assert!(repaired.pieces.iter().all(|p| p.node_id != victim));

    // The checker finds nothing further to do.
    assert_eq!(checker.identify_injured_segments().unwrap(), 0);
    assert!(network.satellite.queue.is_empty().unwrap());

    // And the object still reads back intact.
    let (ranger, _) = store.get("bucket", "obj").await.unwrap();
    assert_eq!(read_all(ranger.as_ref()).await.unwrap(), data);
}

fn upload_pointer(network: &TestNetwork) -> RemoteSegment {
    let (items, _) = network
        .satellite
        .pointers
        .list(
            &network.satellite.api_key,
            &ListRequest {
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();
    network
        .satellite
        .pointers
        .get(&network.satellite.api_key, &items[0].path)
        .unwrap()
        .pointer
        .remote_segment()
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_unrecoverable_segment_is_reported() {
    let network = TestNetwork::new(TestNetworkConfig {
        nodes: 6,
        ..Default::default()
    })
    .await;
    let store = network.object_store(RootKey::random());
    let segment = upload(&network, &store, &vec![0x31u8; 64 * 1024]).await;

    // Lose three of four pieces; only one healthy piece < k = 2 remains.
    for piece in &segment.pieces[..3] {
        network.kill_node(&piece.node_id);
    }

    let segments = network.segment_store();
    let lost: Vec<u32> = segment.pieces[..3].iter().map(|p| p.piece_num).collect();
    let (items, _) = network
        .satellite
        .pointers
        .list(
            &network.satellite.api_key,
            &ListRequest {
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();

    let result = segments.repair(&items[0].path, &lost).await;
    assert!(matches!(
        result,
        Err(orbit_pipeline::PipelineError::Unrecoverable { healthy: 1, required: 2 })
    ));
}

#[tokio::test]
async fn test_audit_detects_tampered_piece() {
    let network = TestNetwork::new(TestNetworkConfig {
        nodes: 4,
        ..Default::default()
    })
    .await;
    let store = network.object_store(RootKey::random());
    let segment = upload(&network, &store, &vec![0xC4u8; 64 * 1024]).await;

    // Flip bits of one stored piece on disk.
    let tampered_piece = &segment.pieces[2];
    let node = network.node(&tampered_piece.node_id).unwrap();
    let derived = segment.piece_id.derive(&tampered_piece.node_id).to_hex();
    let path = node.server.storage().path_for(&derived).unwrap();
    let mut content = std::fs::read(&path).unwrap();
    for byte in &mut content {
        *byte ^= 0xFF;
    }
    std::fs::write(&path, content).unwrap();

    let audit = network.audit_service();
    let report = audit.tick().await.unwrap().unwrap();

    assert_eq!(report.failed, vec![tampered_piece.node_id]);
    assert_eq!(report.failed_piece_nums, vec![tampered_piece.piece_num as usize]);
    assert_eq!(report.success.len(), 3);
    assert!(report.offline.is_empty());

    // Statistics reflect one failure and three passes.
    let bad = network
        .satellite
        .statdb
        .get(&tampered_piece.node_id)
        .unwrap();
    assert_eq!(bad.audit_count, 1);
    assert_eq!(bad.audit_success_count, 0);

    for piece in segment.pieces.iter().filter(|p| p.node_id != tampered_piece.node_id) {
        let stats = network.satellite.statdb.get(&piece.node_id).unwrap();
        assert_eq!(stats.audit_count, 1);
        assert_eq!(stats.audit_success_count, 1);
    }
}

#[tokio::test]
async fn test_audit_counts_offline_nodes() {
    let network = TestNetwork::new(TestNetworkConfig {
        nodes: 4,
        ..Default::default()
    })
    .await;
    let store = network.object_store(RootKey::random());
    let segment = upload(&network, &store, &vec![0x88u8; 64 * 1024]).await;

    // The node goes dark but stays in the overlay.
    let victim = segment.pieces[0].node_id;
    network.transport.unlisten(&victim);

    let audit = network.audit_service();
    let report = audit.tick().await.unwrap().unwrap();

    assert_eq!(report.offline, vec![victim]);
    assert!(report.failed.is_empty());
    assert_eq!(report.success.len(), 3);

    let stats = network.satellite.statdb.get(&victim).unwrap();
    assert_eq!(stats.uptime_count, 1);
    assert_eq!(stats.uptime_success_count, 0);
}

#[tokio::test]
async fn test_statistics_update_matrix_through_batch() {
    let network = TestNetwork::new(TestNetworkConfig::default()).await;
    let statdb = &network.satellite.statdb;
    let id = orbit_core::NodeId::random();

    statdb
        .create(
            &id,
            Some(orbit_proto::NodeStats {
                audit_success_count: 4,
                audit_count: 10,
                audit_ratio: 0.4,
                uptime_success_count: 8,
                uptime_count: 25,
                uptime_ratio: 0.32,
                latency_90: 0,
            }),
        )
        .unwrap();

    let (updated, failed) = statdb
        .update_batch(&[UpdateRequest {
            node_id: id,
            audit: Some(true),
            uptime: Some(false),
            latency: None,
        }])
        .unwrap();
    assert!(failed.is_empty());

    let stats = updated[0];
    assert_eq!(stats.audit_success_count, 5);
    assert_eq!(stats.audit_count, 11);
    assert_eq!(stats.uptime_success_count, 8);
    assert_eq!(stats.uptime_count, 26);
}
