//! Orbit daemon.
//!
//! Hosts either role of the network:
//! - `node`: a storage node serving piece sessions, participating in the
//!   DHT, sweeping expired pieces, and settling bandwidth agreements
//! - `satellite`: the coordinator hosting the pointer, overlay, audit, and
//!   repair services

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use orbit_audit::{AuditCursor, AuditService, Verifier};
use orbit_core::{ApiKey, Keypair, NodeId};
use orbit_dht::{DhtConfig, DhtService};
use orbit_erasure::{RedundancyStrategy, RsScheme};
use orbit_kv::RocksStore;
use orbit_net::demux::{tags, Demux, TaggedTransport};
use orbit_net::{Channel, TcpTransport, Transport};
use orbit_overlay::{Discovery, OverlayCache, StatDb};
use orbit_piecestore::{
    AgreementReceiver, AgreementSender, PieceStoreClient, PieceStoreServer, SatelliteResolver,
    ServerConfig,
};
use orbit_pipeline::{EcClient, SegmentStore, SegmentStoreConfig};
use orbit_pointerdb::{
    AuthedPointers, PointerDb, PointerDbConfig, PointerRpcServer,
};
use orbit_proto::{NodeAddress, NodeDescriptor};
use orbit_repair::{Checker, RepairQueue, RepairWorker};

#[derive(Parser)]
#[command(name = "orbitd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Node(NodeArgs),
    /// Run a satellite
    Satellite(SatelliteArgs),
}

#[derive(Parser)]
struct NodeArgs {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:7777")]
    listen: SocketAddr,

    /// Data directory (identity, pieces, database)
    #[arg(short, long, default_value = ".orbit-node")]
    data_dir: PathBuf,

    /// Disk bytes committed to the network
    #[arg(long, default_value_t = 10 << 30)]
    space: i64,

    /// Bandwidth bytes committed per window
    #[arg(long, default_value_t = 100 << 30)]
    bandwidth: i64,

    /// Satellite address (host:port)
    #[arg(long)]
    satellite: String,

    /// Satellite node id (hex)
    #[arg(long)]
    satellite_id: String,

    /// Satellite public key (hex); authorizations from other keys are
    /// rejected
    #[arg(long)]
    satellite_key: String,

    /// Seconds between settlement checks
    #[arg(long, default_value_t = 3600)]
    settle_interval: u64,

    /// Seconds between TTL sweeps
    #[arg(long, default_value_t = 300)]
    sweep_interval: u64,
}

#[derive(Parser)]
struct SatelliteArgs {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:7778")]
    listen: SocketAddr,

    /// Data directory
    #[arg(short, long, default_value = ".orbit-satellite")]
    data_dir: PathBuf,

    /// API key (URL-safe base64); generated and printed when omitted
    #[arg(long)]
    api_key: Option<String>,

    /// Erasure required count (k)
    #[arg(long, default_value_t = 2)]
    required: usize,

    /// Repair threshold (r)
    #[arg(long, default_value_t = 3)]
    repair_threshold: usize,

    /// Optimal threshold (o)
    #[arg(long, default_value_t = 3)]
    optimal_threshold: usize,

    /// Total shares (n)
    #[arg(long, default_value_t = 4)]
    total: usize,

    /// Erasure share size in bytes
    #[arg(long, default_value_t = 1 << 20)]
    share_size: usize,

    /// Maximum inline segment size in bytes
    #[arg(long, default_value_t = 4096)]
    max_inline_size: usize,

    /// Minimum remote segment size in bytes
    #[arg(long, default_value_t = 1)]
    min_remote_size: i64,

    /// Seconds between repair checks
    #[arg(long, default_value_t = 30)]
    check_interval: u64,

    /// Seconds between audits
    #[arg(long, default_value_t = 30)]
    audit_interval: u64,

    /// Seconds between discovery refreshes
    #[arg(long, default_value_t = 60)]
    refresh_interval: u64,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Loads the identity seed or creates one on first start.
fn load_identity(data_dir: &Path) -> Result<Keypair> {
    let path = data_dir.join("identity.key");
    if path.exists() {
        let hex_seed = std::fs::read_to_string(&path).context("reading identity")?;
        let raw = hex::decode(hex_seed.trim()).context("decoding identity")?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .context("identity must be 32 bytes")?;
        Ok(Keypair::from_seed(&seed))
    } else {
        std::fs::create_dir_all(data_dir)?;
        let keypair = Keypair::generate();
        std::fs::write(&path, hex::encode(keypair.seed())).context("writing identity")?;
        info!(path = %path.display(), "generated new identity");
        Ok(keypair)
    }
}

fn parse_node_id(value: &str) -> Result<NodeId> {
    NodeId::from_hex(value).map_err(|e| anyhow::anyhow!("invalid node id: {e}"))
}

fn parse_public_key(value: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(value).context("decoding public key")?;
    raw.as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))
}

/// Bridges a bounded acceptor into the unbounded form some services take.
fn bridge(mut rx: mpsc::Receiver<Channel>) -> mpsc::UnboundedReceiver<Channel> {
    let (tx, out) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(channel) = rx.recv().await {
            if tx.send(channel).is_err() {
                break;
            }
        }
    });
    out
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
        let _ = tx.send(true);
    }
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let keypair = load_identity(&args.data_dir)?;
    let node_id = NodeId::new(keypair.public_key());
    info!(node_id = %node_id, listen = %args.listen, "storage node starting");

    let satellite_id = parse_node_id(&args.satellite_id)?;
    let satellite_key = parse_public_key(&args.satellite_key)?;
    let satellite = NodeDescriptor::new(satellite_id, NodeAddress::new(args.satellite.clone()));

    let db = Arc::new(RocksStore::open(&args.data_dir.join("db"))?);
    let server = Arc::new(PieceStoreServer::new(
        ServerConfig {
            node_id,
            piece_dir: args.data_dir.join("pieces"),
            space_allocated: args.space,
            bandwidth_allocated: args.bandwidth,
            satellite_key: Some(satellite_key),
        },
        db,
    ));

    let (local_addr, acceptor) = TcpTransport::listen(args.listen).await?;
    info!(%local_addr, "listening");

    let mut demux = Demux::new();
    let pieces = demux.register(tags::PIECES);
    let dht_sessions = demux.register(tags::DHT);
    tokio::spawn(demux.run(acceptor));

    tokio::spawn(server.clone().run_bounded(pieces));

    let tcp: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let dht = Arc::new(DhtService::new(
        NodeDescriptor::new(node_id, NodeAddress::new(local_addr.to_string())),
        DhtConfig::default(),
        Arc::new(TaggedTransport::new(tcp.clone(), tags::DHT)),
    ));
    tokio::spawn(dht.clone().serve(bridge(dht_sessions)));

    let known = dht.bootstrap(&[satellite.clone()]).await;
    info!(known, "joined the network");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        server
            .clone()
            .run_ttl_sweep(Duration::from_secs(args.sweep_interval), shutdown_rx.clone()),
    );

    let resolver: SatelliteResolver = {
        let satellite = satellite.clone();
        Arc::new(move |id| (id == satellite.id).then(|| satellite.clone()))
    };
    let sender = AgreementSender::new(
        server.db().clone(),
        Arc::new(TaggedTransport::new(tcp.clone(), tags::AGREEMENTS)),
        resolver,
        Duration::from_secs(args.settle_interval),
    );
    {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { sender.run(shutdown_rx).await });
    }

    // Stay visible to the satellite's discovery.
    {
        let dht = dht.clone();
        let satellite = satellite.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !dht.ping(&satellite).await {
                            warn!("satellite unreachable");
                        }
                        dht.maintenance();
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    shutdown_signal(shutdown_tx).await;
    Ok(())
}

async fn run_satellite(args: SatelliteArgs) -> Result<()> {
    let keypair = Arc::new(load_identity(&args.data_dir)?);
    let satellite_id = NodeId::new(keypair.public_key());

    let api_key = match &args.api_key {
        Some(rendered) => {
            ApiKey::from_base64(rendered).context("invalid --api-key")?
        }
        None => {
            let key = ApiKey::random();
            info!(api_key = %key.to_base64(), "generated API key");
            key
        }
    };

    info!(
        satellite_id = %satellite_id,
        public_key = %hex::encode(keypair.public_key()),
        listen = %args.listen,
        "satellite starting"
    );

    let cache = Arc::new(OverlayCache::new(Arc::new(RocksStore::open(
        &args.data_dir.join("overlay"),
    )?)));
    let statdb = Arc::new(StatDb::new(Arc::new(RocksStore::open(
        &args.data_dir.join("stats"),
    )?)));
    let queue = Arc::new(RepairQueue::new(Arc::new(RocksStore::open(
        &args.data_dir.join("repair"),
    )?)));
    let settlements = Arc::new(AgreementReceiver::new(Arc::new(RocksStore::open(
        &args.data_dir.join("settlements"),
    )?)));

    let pointers = Arc::new(PointerDb::new(
        Arc::new(RocksStore::open(&args.data_dir.join("pointers"))?),
        cache.clone(),
        PointerDbConfig {
            api_key: api_key.clone(),
            min_remote_segment_size: args.min_remote_size,
            max_inline_segment_size: args.max_inline_size,
            attach_nodes: true,
            ..Default::default()
        },
        keypair.clone(),
        satellite_id,
    ));

    let (local_addr, acceptor) = TcpTransport::listen(args.listen).await?;
    info!(%local_addr, "listening");

    let mut demux = Demux::new();
    let pointer_sessions = demux.register(tags::POINTERS);
    let agreement_sessions = demux.register(tags::AGREEMENTS);
    let dht_sessions = demux.register(tags::DHT);
    tokio::spawn(demux.run(acceptor));

    tokio::spawn(Arc::new(PointerRpcServer::new(pointers.clone())).run(pointer_sessions));

    {
        let settlements = settlements.clone();
        let mut agreement_sessions = agreement_sessions;
        tokio::spawn(async move {
            while let Some(channel) = agreement_sessions.recv().await {
                let settlements = settlements.clone();
                tokio::spawn(async move { settlements.handle_session(channel).await });
            }
        });
    }

    let tcp: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let dht = Arc::new(DhtService::new(
        NodeDescriptor::new(satellite_id, NodeAddress::new(local_addr.to_string())),
        DhtConfig::default(),
        Arc::new(TaggedTransport::new(tcp.clone(), tags::DHT)),
    ));
    tokio::spawn(dht.clone().serve(bridge(dht_sessions)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Discovery keeps the overlay cache fed from the DHT.
    {
        let discovery = Discovery::new(
            dht.clone(),
            cache.clone(),
            Duration::from_secs(args.refresh_interval),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { discovery.run(shutdown_rx).await });
    }

    // The repair worker acts as an uplink with the satellite's own key.
    let strategy = RedundancyStrategy::new(
        Arc::new(RsScheme::new(args.required, args.total, args.share_size)?),
        args.repair_threshold,
        args.optimal_threshold,
    )?;
    let piece_client = PieceStoreClient::new(
        Arc::new(TaggedTransport::new(tcp.clone(), tags::PIECES)),
        keypair.clone(),
    );
    let segments = Arc::new(SegmentStore::new(
        Arc::new(AuthedPointers::new(pointers.clone(), api_key.clone())),
        cache.clone(),
        EcClient::new(piece_client.clone(), 8 << 20),
        SegmentStoreConfig {
            strategy,
            inline_threshold: args.max_inline_size,
        },
        keypair.clone(),
        satellite_id,
    ));

    {
        let checker = Checker::new(
            pointers.clone(),
            api_key.clone(),
            cache.clone(),
            queue.clone(),
            0,
            Duration::from_secs(args.check_interval),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { checker.run(shutdown_rx).await });
    }
    {
        let worker = RepairWorker::new(
            queue.clone(),
            segments.clone(),
            Duration::from_secs(args.check_interval),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await });
    }
    {
        let audit = AuditService::new(
            AuditCursor::new(pointers.clone(), api_key.clone()),
            Verifier::new(piece_client, cache.clone()),
            statdb.clone(),
            cache.clone(),
            Duration::from_secs(args.audit_interval),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { audit.run(shutdown_rx).await });
    }

    // Reclamation of pieces orphaned by pointer overwrites.
    {
        let pointers = pointers.clone();
        let cache = cache.clone();
        let ec = EcClient::new(
            PieceStoreClient::new(
                Arc::new(TaggedTransport::new(tcp.clone(), tags::PIECES)),
                keypair.clone(),
            ),
            8 << 20,
        );
        let authorization = pointers.authorization();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let batch = match pointers.take_reclaimable(100) {
                            Ok(batch) => batch,
                            Err(err) => {
                                error!(error = %err, "reclamation scan failed");
                                continue;
                            }
                        };
                        for pointer in batch {
                            let Some(segment) = pointer.remote_segment() else { continue };
                            let ids: Vec<NodeId> =
                                segment.pieces.iter().map(|p| p.node_id).collect();
                            let Ok(nodes) = cache.bulk_lookup(&ids) else { continue };
                            if let Err(err) =
                                ec.delete(&nodes, segment.piece_id, &authorization).await
                            {
                                warn!(error = %err, "reclamation delete failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    shutdown_signal(shutdown_tx).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Node(args) => run_node(args).await,
        Commands::Satellite(args) => run_satellite(args).await,
    }
}
