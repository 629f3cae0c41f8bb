//! The in-process test network.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::info;

use orbit_audit::{AuditCursor, AuditService, Verifier};
use orbit_core::{ApiKey, Keypair, NodeId, RootKey};
use orbit_erasure::{RedundancyStrategy, RsScheme};
use orbit_kv::MemoryStore;
use orbit_net::LocalTransport;
use orbit_overlay::{OverlayCache, StatDb};
use orbit_piecestore::{
    AgreementReceiver, PieceStoreClient, PieceStoreServer, ServerConfig,
};
use orbit_pipeline::{EcClient, ObjectStore, SegmentStore, SegmentStoreConfig};
use orbit_pointerdb::{AuthedPointers, PointerDb, PointerDbConfig};
use orbit_proto::{NodeAddress, NodeDescriptor};
use orbit_repair::{Checker, RepairQueue, RepairWorker};

/// Knobs for a test network.
#[derive(Debug, Clone)]
pub struct TestNetworkConfig {
    /// Number of storage nodes.
    pub nodes: usize,
    /// Erasure required count (k).
    pub required: usize,
    /// Repair threshold (r).
    pub repair: usize,
    /// Optimal threshold (o).
    pub optimal: usize,
    /// Total shares (n).
    pub total: usize,
    /// Share size in bytes (s).
    pub share_size: usize,
    /// Inline threshold in bytes.
    pub inline_threshold: usize,
}

impl Default for TestNetworkConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            required: 2,
            repair: 3,
            optimal: 3,
            total: 4,
            share_size: 1024,
            inline_threshold: 4096,
        }
    }
}

/// The satellite side of a test network.
pub struct TestSatellite {
    /// Satellite identity.
    pub id: NodeId,
    /// Satellite signing key.
    pub keypair: Arc<Keypair>,
    /// API key uplinks use.
    pub api_key: ApiKey,
    /// Pointer service.
    pub pointers: Arc<PointerDb>,
    /// Overlay cache.
    pub cache: Arc<OverlayCache>,
    /// Statistics store.
    pub statdb: Arc<StatDb>,
    /// Repair queue.
    pub queue: Arc<RepairQueue>,
    /// Settlement receiver.
    pub agreements: Arc<AgreementReceiver>,
}

/// One storage node in a test network.
pub struct TestStorageNode {
    /// Node identity.
    pub id: NodeId,
    /// Overlay descriptor.
    pub descriptor: NodeDescriptor,
    /// The piece server.
    pub server: Arc<PieceStoreServer>,
    _dir: TempDir,
}

/// A complete single-process network.
pub struct TestNetwork {
    /// Shared in-memory transport.
    pub transport: LocalTransport,
    /// The satellite.
    pub satellite: TestSatellite,
    /// Storage nodes.
    pub nodes: Vec<TestStorageNode>,
    /// The uplink's signing key.
    pub uplink_key: Arc<Keypair>,
    /// The uplink's identity.
    pub uplink_id: NodeId,
    config: TestNetworkConfig,
}

impl TestNetwork {
    /// Builds and starts a network.
    pub async fn new(config: TestNetworkConfig) -> Self {
        let transport = LocalTransport::new();

        let satellite_key = Arc::new(Keypair::generate());
        let satellite_id = NodeId::random();
        let api_key = ApiKey::random();

        let cache = Arc::new(OverlayCache::new(Arc::new(MemoryStore::new())));
        let statdb = Arc::new(StatDb::new(Arc::new(MemoryStore::new())));
        let queue = Arc::new(RepairQueue::new(Arc::new(MemoryStore::new())));
        let agreements = Arc::new(AgreementReceiver::new(Arc::new(MemoryStore::new())));

        let pointers = Arc::new(PointerDb::new(
            Arc::new(MemoryStore::new()),
            cache.clone(),
            PointerDbConfig {
                api_key: api_key.clone(),
                min_remote_segment_size: 1,
                max_inline_segment_size: config.inline_threshold,
                attach_nodes: true,
                ..Default::default()
            },
            satellite_key.clone(),
            satellite_id,
        ));

        // The satellite accepts settlement sessions on its own id.
        {
            let mut acceptor = transport.listen(satellite_id);
            let agreements = agreements.clone();
            tokio::spawn(async move {
                while let Some(channel) = acceptor.recv().await {
                    let agreements = agreements.clone();
                    tokio::spawn(async move { agreements.handle_session(channel).await });
                }
            });
        }

        let mut nodes = Vec::with_capacity(config.nodes);
        for index in 0..config.nodes {
            let node = Self::start_node(&transport, &satellite_key, index).await;
            cache.put(&node.descriptor).expect("cache accepts node");
            statdb
                .create_if_not_exists(&node.id)
                .expect("statdb accepts node");
            nodes.push(node);
        }

        info!(nodes = nodes.len(), "test network ready");
        Self {
            transport,
            satellite: TestSatellite {
                id: satellite_id,
                keypair: satellite_key,
                api_key,
                pointers,
                cache,
                statdb,
                queue,
                agreements,
            },
            nodes,
            uplink_key: Arc::new(Keypair::generate()),
            uplink_id: NodeId::random(),
            config,
        }
    }

    async fn start_node(
        transport: &LocalTransport,
        satellite_key: &Keypair,
        index: usize,
    ) -> TestStorageNode {
        let dir = TempDir::new().expect("tempdir");
        let id = NodeId::random();
        let server = Arc::new(PieceStoreServer::new(
            ServerConfig {
                node_id: id,
                piece_dir: dir.path().to_path_buf(),
                space_allocated: 1 << 30,
                bandwidth_allocated: 1 << 30,
                satellite_key: Some(satellite_key.public_key()),
            },
            Arc::new(MemoryStore::new()),
        ));

        let acceptor = transport.listen(id);
        tokio::spawn(server.clone().run(acceptor));

        TestStorageNode {
            id,
            descriptor: NodeDescriptor::new(id, NodeAddress::new(format!("node-{index}"))),
            server,
            _dir: dir,
        }
    }

    /// The configured redundancy strategy.
    pub fn strategy(&self) -> RedundancyStrategy {
        RedundancyStrategy::new(
            Arc::new(
                RsScheme::new(
                    self.config.required,
                    self.config.total,
                    self.config.share_size,
                )
                .expect("valid scheme"),
            ),
            self.config.repair,
            self.config.optimal,
        )
        .expect("valid thresholds")
    }

    /// A piece client signing as the uplink.
    pub fn piece_client(&self) -> PieceStoreClient {
        PieceStoreClient::new(Arc::new(self.transport.clone()), self.uplink_key.clone())
    }

    /// A segment store for the uplink.
    pub fn segment_store(&self) -> Arc<SegmentStore> {
        Arc::new(SegmentStore::new(
            Arc::new(AuthedPointers::new(
                self.satellite.pointers.clone(),
                self.satellite.api_key.clone(),
            )),
            self.satellite.cache.clone(),
            EcClient::new(self.piece_client(), 4 << 20),
            SegmentStoreConfig {
                strategy: self.strategy(),
                inline_threshold: self.config.inline_threshold,
            },
            self.uplink_key.clone(),
            self.uplink_id,
        ))
    }

    /// An object store for the uplink with the given root key.
    pub fn object_store(&self, root: RootKey) -> ObjectStore {
        ObjectStore::new(
            SegmentStore::new(
                Arc::new(AuthedPointers::new(
                    self.satellite.pointers.clone(),
                    self.satellite.api_key.clone(),
                )),
                self.satellite.cache.clone(),
                EcClient::new(self.piece_client(), 4 << 20),
                SegmentStoreConfig {
                    strategy: self.strategy(),
                    inline_threshold: self.config.inline_threshold,
                },
                self.uplink_key.clone(),
                self.uplink_id,
            ),
            Arc::new(root),
        )
        .expect("valid object store")
    }

    /// A repair checker over the satellite state.
    pub fn checker(&self) -> Checker {
        Checker::new(
            self.satellite.pointers.clone(),
            self.satellite.api_key.clone(),
            self.satellite.cache.clone(),
            self.satellite.queue.clone(),
            0,
            Duration::from_secs(3600),
        )
    }

    /// A repair worker over the satellite state.
    pub fn repair_worker(&self) -> RepairWorker {
        RepairWorker::new(
            self.satellite.queue.clone(),
            self.segment_store(),
            Duration::from_secs(3600),
        )
    }

    /// An audit service over the satellite state.
    ///
    /// The verifier countersigns with the satellite key, matching the GET
    /// allocations the pointer service attaches for audits.
    pub fn audit_service(&self) -> AuditService {
        let satellite_client = PieceStoreClient::new(
            Arc::new(self.transport.clone()),
            self.satellite.keypair.clone(),
        );
        AuditService::new(
            AuditCursor::new(
                self.satellite.pointers.clone(),
                self.satellite.api_key.clone(),
            ),
            Verifier::new(satellite_client, self.satellite.cache.clone()),
            self.satellite.statdb.clone(),
            self.satellite.cache.clone(),
            Duration::from_secs(3600),
        )
    }

    /// Finds a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&TestStorageNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Takes a node off the network: dials fail and the overlay marks it
    /// unreachable, as if the process died.
    pub fn kill_node(&self, id: &NodeId) {
        self.transport.unlisten(id);
        let _ = self.satellite.cache.mark_unreachable(id);
    }
}
