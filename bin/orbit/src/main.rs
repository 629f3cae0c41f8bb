//! Orbit uplink CLI.
//!
//! Uploads are encrypted and erasure-coded client-side; the satellite only
//! ever sees ciphertext and piece locations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use orbit_core::ranger::read_all;
use orbit_core::{ApiKey, Keypair, NodeId, RootKey, Timestamp};
use orbit_erasure::{RedundancyStrategy, RsScheme};
use orbit_net::demux::{tags, TaggedTransport};
use orbit_net::{TcpTransport, Transport};
use orbit_piecestore::PieceStoreClient;
use orbit_pipeline::{EcClient, ObjectStore, SegmentStore, SegmentStoreConfig};
use orbit_pointerdb::RemotePointers;
use orbit_proto::{NodeAddress, NodeDescriptor};

#[derive(Parser)]
#[command(name = "orbit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Satellite address (host:port)
    #[arg(long, env = "ORBIT_SATELLITE")]
    satellite: String,

    /// Satellite node id (hex)
    #[arg(long, env = "ORBIT_SATELLITE_ID")]
    satellite_id: String,

    /// API key (URL-safe base64)
    #[arg(long, env = "ORBIT_API_KEY")]
    api_key: String,

    /// Encryption passphrase
    #[arg(long, env = "ORBIT_PASSPHRASE")]
    passphrase: String,

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

    /// Inline threshold in bytes
    #[arg(long, default_value_t = 4096)]
    inline_threshold: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a bucket
    Mb {
        /// Bucket name
        bucket: String,
    },
    /// Remove an empty bucket
    Rb {
        /// Bucket name
        bucket: String,
    },
    /// List buckets, or objects in a bucket
    Ls {
        /// Bucket to list; omit to list buckets
        bucket: Option<String>,
        /// List every object instead of collapsing directories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Upload a file
    Put {
        /// Destination as bucket/path
        target: String,
        /// Source file
        file: PathBuf,
    },
    /// Download an object
    Get {
        /// Source as bucket/path
        source: String,
        /// Destination file; stdout when omitted
        file: Option<PathBuf>,
    },
    /// Delete an object
    Rm {
        /// Target as bucket/path
        target: String,
    },
}

fn split_target(target: &str) -> Result<(&str, &str)> {
    match target.split_once('/') {
        Some((bucket, path)) if !bucket.is_empty() && !path.is_empty() => Ok((bucket, path)),
        _ => bail!("target must look like bucket/path, got {target:?}"),
    }
}

struct Uplink {
    pointers: Arc<RemotePointers>,
    objects: ObjectStore,
}

impl Uplink {
    fn connect(cli: &Cli) -> Result<Self> {
        let satellite_id =
            NodeId::from_hex(&cli.satellite_id).map_err(|e| anyhow::anyhow!("bad satellite id: {e}"))?;
        let satellite =
            NodeDescriptor::new(satellite_id, NodeAddress::new(cli.satellite.clone()));
        let api_key = ApiKey::from_base64(&cli.api_key).context("invalid API key")?;

        let tcp: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let pointers = Arc::new(RemotePointers::new(
            Arc::new(TaggedTransport::new(tcp.clone(), tags::POINTERS)),
            satellite,
            api_key,
        ));

        let strategy = RedundancyStrategy::new(
            Arc::new(RsScheme::new(cli.required, cli.total, cli.share_size)?),
            cli.repair_threshold,
            cli.optimal_threshold,
        )?;

        let keypair = Arc::new(Keypair::generate());
        let uplink_id = NodeId::new(keypair.public_key());
        let piece_client = PieceStoreClient::new(
            Arc::new(TaggedTransport::new(tcp, tags::PIECES)),
            keypair.clone(),
        );

        let segments = SegmentStore::new(
            pointers.clone(),
            pointers.clone(),
            EcClient::new(piece_client, 8 << 20),
            SegmentStoreConfig {
                strategy,
                inline_threshold: cli.inline_threshold,
            },
            keypair,
            uplink_id,
        );

        let root = RootKey::from_passphrase(&cli.passphrase);
        let objects = ObjectStore::new(segments, Arc::new(root))?;

        Ok(Self { pointers, objects })
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

async fn run(cli: Cli) -> Result<()> {
    let uplink = Uplink::connect(&cli)?;

    match &cli.command {
        Commands::Mb { bucket } => {
            uplink.pointers.create_bucket(bucket).await?;
            println!("created bucket {bucket}");
        }
        Commands::Rb { bucket } => {
            uplink.pointers.delete_bucket(bucket).await?;
            println!("removed bucket {bucket}");
        }
        Commands::Ls { bucket: None, .. } => {
            for bucket in uplink.pointers.list_buckets().await? {
                println!("{}", bucket.name);
            }
        }
        Commands::Ls {
            bucket: Some(bucket),
            recursive,
        } => {
            let (items, more) = uplink.objects.list(bucket, *recursive, 0).await?;
            for item in items {
                match item.meta {
                    Some(meta) => println!("{:>12}  {}", meta.size, item.path),
                    None => println!("{:>12}  {}", "PRE", item.path),
                }
            }
            if more {
                println!("...");
            }
        }
        Commands::Put { target, file } => {
            let (bucket, path) = split_target(target)?;
            let source = tokio::fs::File::open(file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let meta = uplink
                .objects
                .put(
                    bucket,
                    path,
                    source,
                    Vec::new(),
                    Timestamp::unset(),
                    no_cancel(),
                )
                .await?;
            println!("uploaded {target} ({} bytes)", meta.size);
        }
        Commands::Get { source, file } => {
            let (bucket, path) = split_target(source)?;
            let (ranger, _) = uplink.objects.get(bucket, path).await?;
            let data = read_all(ranger.as_ref()).await?;
            match file {
                Some(file) => {
                    tokio::fs::write(file, &data)
                        .await
                        .with_context(|| format!("writing {}", file.display()))?;
                    println!("downloaded {source} ({} bytes)", data.len());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Rm { target } => {
            let (bucket, path) = split_target(target)?;
            uplink.objects.delete(bucket, path).await?;
            println!("deleted {target}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    run(cli).await
}
