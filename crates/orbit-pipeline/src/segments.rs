//! Segment store: inline/remote classification, dispersal, repair.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use orbit_core::ranger::{ByteRanger, Ranger};
use orbit_core::{Keypair, NodeId, PieceId, Timestamp};
use orbit_erasure::{ErasureScheme, RedundancyStrategy, RsScheme};
use orbit_overlay::{ChooseOptions, NodeSelector};
use orbit_pointerdb::{ListRequest, Pointers};
use orbit_proto::{
    BandwidthAction, NodeDescriptor, PayerBandwidthAllocation, Pointer, RedundancyScheme,
    RemotePiece, RemoteSegment, SignedMessage,
};

use crate::ec::EcClient;
use crate::peek::PeekThresholdReader;
use crate::PipelineError;

/// Segment store configuration.
#[derive(Clone)]
pub struct SegmentStoreConfig {
    /// Redundancy used for new segments.
    pub strategy: RedundancyStrategy,
    /// Segments at or below this many bytes are stored inline.
    pub inline_threshold: usize,
}

/// Metadata of one stored segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Last pointer write time.
    pub modified: Timestamp,
    /// Expiration; unset means never.
    pub expiration: Timestamp,
    /// Stored (ciphertext) size in bytes.
    pub size: i64,
    /// Opaque caller metadata.
    pub metadata: Vec<u8>,
}

impl SegmentMeta {
    fn from_pointer(pointer: &Pointer) -> Self {
        Self {
            modified: pointer.creation,
            expiration: pointer.expiration,
            size: pointer.segment_size,
            metadata: pointer.metadata.clone(),
        }
    }
}

/// One listing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentItem {
    /// Path relative to the listed prefix.
    pub path: String,
    /// Metadata projection, absent for prefix entries.
    pub meta: Option<SegmentMeta>,
    /// True for collapsed directory entries.
    pub is_prefix: bool,
}

/// Counts bytes as they stream through.
pub struct SizeReader<R> {
    inner: R,
    count: Arc<AtomicI64>,
}

impl<R> SizeReader<R> {
    /// Wraps a reader, returning the shared byte counter.
    pub fn new(inner: R) -> (Self, Arc<AtomicI64>) {
        let count = Arc::new(AtomicI64::new(0));
        (
            Self {
                inner,
                count: count.clone(),
            },
            count,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                this.count.fetch_add(read as i64, Ordering::SeqCst);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// The segment pipeline.
pub struct SegmentStore {
    pointers: Arc<dyn Pointers>,
    selector: Arc<dyn NodeSelector>,
    ec: EcClient,
    config: SegmentStoreConfig,
    keypair: Arc<Keypair>,
    uplink_id: NodeId,
}

impl SegmentStore {
    /// Creates a segment store.
    pub fn new(
        pointers: Arc<dyn Pointers>,
        selector: Arc<dyn NodeSelector>,
        ec: EcClient,
        config: SegmentStoreConfig,
        keypair: Arc<Keypair>,
        uplink_id: NodeId,
    ) -> Self {
        Self {
            pointers,
            selector,
            ec,
            config,
            keypair,
            uplink_id,
        }
    }

    /// The configured redundancy.
    pub fn strategy(&self) -> &RedundancyStrategy {
        &self.config.strategy
    }

    async fn payer(
        &self,
        action: BandwidthAction,
    ) -> Result<PayerBandwidthAllocation, PipelineError> {
        Ok(self
            .pointers
            .payer_allocation(action, self.uplink_id, self.keypair.public_key())
            .await?)
    }

    async fn authorization(&self) -> Result<SignedMessage, PipelineError> {
        Ok(self.pointers.authorization().await?)
    }

    /// Stores one segment; `segment_info` is called after dispersal to
    /// provide the path and metadata (sizes are only known by then).
    pub async fn put(
        &self,
        data: impl AsyncRead + Send + Unpin + 'static,
        expiration: Timestamp,
        cancel: watch::Receiver<bool>,
        segment_info: impl FnOnce() -> (String, Vec<u8>) + Send,
    ) -> Result<SegmentMeta, PipelineError> {
        let mut peek = PeekThresholdReader::new(data);
        let remote_sized = peek.is_larger_than(self.config.inline_threshold).await?;

        if !remote_sized {
            let inline = peek.peeked().to_vec();
            let (path, metadata) = segment_info();
            let pointer = Pointer::inline(inline, expiration, metadata);
            self.pointers.put(&path, pointer).await?;
            return self.meta(&path).await;
        }

        let total = self.config.strategy.total_count();
        let nodes: Vec<Option<NodeDescriptor>> = self
            .selector
            .choose_nodes(&ChooseOptions {
                amount: total,
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(Some)
            .collect();

        let piece_id = PieceId::random();
        let (sized, counter) = SizeReader::new(peek);
        let payer = self.payer(BandwidthAction::Put).await?;
        let authorization = self.authorization().await?;

        let successful = self
            .ec
            .put(
                &nodes,
                &self.config.strategy,
                piece_id,
                sized,
                expiration,
                &payer,
                &authorization,
                cancel,
            )
            .await?;

        let segment_size = counter.load(Ordering::SeqCst);
        let (path, metadata) = segment_info();
        let pointer = make_remote_pointer(
            &successful,
            &self.config.strategy,
            piece_id,
            segment_size,
            expiration,
            metadata,
        );

        if let Err(err) = self.pointers.put(&path, pointer).await {
            // The pieces are orphans without a pointer; clean them up.
            warn!(error = %err, "pointer write failed, deleting stored pieces");
            let _ = self.ec.delete(&successful, piece_id, &authorization).await;
            return Err(err.into());
        }

        self.meta(&path).await
    }

    /// Returns a lazy ranger over the stored segment plus its metadata.
    pub async fn get(&self, path: &str) -> Result<(Arc<dyn Ranger>, SegmentMeta), PipelineError> {
        let result = self.pointers.get(path).await?;
        let meta = SegmentMeta::from_pointer(&result.pointer);

        let Some(segment) = result.pointer.remote_segment() else {
            let inline = result
                .pointer
                .inline_segment()
                .expect("pointer is inline or remote")
                .to_vec();
            return Ok((Arc::new(ByteRanger::new(inline)), meta));
        };

        let nodes = self.node_slots(segment, result.nodes.as_deref()).await?;
        let scheme = make_scheme(&segment.redundancy)?;
        // The allocation must be bound to this uplink's key so nodes accept
        // its countersignatures.
        let payer = self.payer(BandwidthAction::Get).await?;
        let ranger = self.ec.get(
            &nodes,
            scheme,
            segment.piece_id,
            result.pointer.segment_size,
            &payer,
            &result.authorization,
        )?;
        Ok((ranger, meta))
    }

    /// Returns segment metadata.
    pub async fn meta(&self, path: &str) -> Result<SegmentMeta, PipelineError> {
        let result = self.pointers.get(path).await?;
        Ok(SegmentMeta::from_pointer(&result.pointer))
    }

    /// Deletes the segment's pieces and its pointer.
    pub async fn delete(&self, path: &str) -> Result<(), PipelineError> {
        let result = self.pointers.get(path).await?;

        if let Some(segment) = result.pointer.remote_segment() {
            let nodes = self.node_slots(segment, result.nodes.as_deref()).await?;
            self.ec
                .delete(&nodes, segment.piece_id, &result.authorization)
                .await?;
        }

        self.pointers.delete(path).await?;
        Ok(())
    }

    /// Reconstructs the pieces listed in `lost` onto fresh nodes and
    /// rewrites the pointer with the merged piece set.
    pub async fn repair(&self, path: &str, lost: &[u32]) -> Result<(), PipelineError> {
        let result = self.pointers.get(path).await?;
        let Some(segment) = result.pointer.remote_segment() else {
            return Err(PipelineError::Validation(format!(
                "cannot repair inline segment at {path:?}"
            )));
        };
        let redundancy = segment.redundancy;
        let piece_id = segment.piece_id;
        let total = redundancy.total as usize;
        let required = redundancy.required as usize;

        let mut survivors = self.node_slots(segment, result.nodes.as_deref()).await?;
        for &lost_index in lost {
            if (lost_index as usize) < survivors.len() {
                survivors[lost_index as usize] = None;
            }
        }

        let healthy: Vec<NodeId> = survivors.iter().flatten().map(|n| n.id).collect();
        if healthy.len() < required {
            return Err(PipelineError::Unrecoverable {
                healthy: healthy.len(),
                required,
            });
        }
        let missing = total - healthy.len();
        if missing == 0 {
            return Ok(());
        }

        info!(path, missing, "repairing segment");
        let mut replacements = self
            .selector
            .choose_nodes(&ChooseOptions {
                amount: missing,
                excluded: healthy,
                ..Default::default()
            })
            .await?;

        // New nodes take exactly the missing positions; surviving positions
        // are skips for the re-upload.
        let mut repair_slots: Vec<Option<NodeDescriptor>> = vec![None; total];
        for (index, slot) in survivors.iter().enumerate() {
            if slot.is_none() {
                repair_slots[index] = replacements.pop();
            }
        }

        let scheme = make_scheme(&redundancy)?;
        let segment_size = result.pointer.segment_size;
        let strategy = make_strategy(&redundancy)?;

        let get_payer = self.payer(BandwidthAction::Get).await?;
        let download = self.ec.get(
            &survivors,
            scheme,
            piece_id,
            segment_size,
            &get_payer,
            &result.authorization,
        )?;
        let reader = download.range(0, download.size()).await?;

        let payer = self.payer(BandwidthAction::Put).await?;
        let authorization = self.authorization().await?;
        let (no_cancel_tx, no_cancel) = watch::channel(false);

        // The re-encode only reaches the missing positions; survivor slots
        // are None and the erasure layout is stable in share index.
        let mut upload_slots = repair_slots;
        for (index, survivor) in survivors.iter().enumerate() {
            debug_assert!(upload_slots[index].is_none() || survivor.is_none());
        }
        let stored = self
            .ec
            .put(
                &upload_slots,
                &strategy,
                piece_id,
                reader,
                result.pointer.expiration,
                &payer,
                &authorization,
                no_cancel,
            )
            .await?;
        drop(no_cancel_tx);

        // Merge survivors and replacements into the new pointer.
        let mut merged = survivors;
        for (index, slot) in stored.into_iter().enumerate() {
            if slot.is_some() {
                merged[index] = slot;
            }
        }

        let pointer = make_remote_pointer(
            &merged,
            &strategy,
            piece_id,
            segment_size,
            result.pointer.expiration,
            result.pointer.metadata.clone(),
        );
        self.pointers.put(path, pointer).await?;
        Ok(())
    }

    /// Lists segments under a prefix.
    pub async fn list(
        &self,
        request: &ListRequest,
    ) -> Result<(Vec<SegmentItem>, bool), PipelineError> {
        let (items, more) = self.pointers.list(request).await?;
        let items = items
            .into_iter()
            .map(|item| SegmentItem {
                path: item.path,
                meta: item.pointer.as_ref().map(SegmentMeta::from_pointer),
                is_prefix: item.is_prefix,
            })
            .collect();
        Ok((items, more))
    }

    /// Builds the piece-number-indexed node slot list for a segment.
    async fn node_slots(
        &self,
        segment: &RemoteSegment,
        resolved: Option<&[Option<NodeDescriptor>]>,
    ) -> Result<Vec<Option<NodeDescriptor>>, PipelineError> {
        let mut slots: Vec<Option<NodeDescriptor>> =
            vec![None; segment.redundancy.total as usize];

        let nodes: Vec<Option<NodeDescriptor>> = match resolved {
            Some(nodes) => nodes.to_vec(),
            None => {
                let ids: Vec<NodeId> = segment.pieces.iter().map(|p| p.node_id).collect();
                self.selector.lookup_nodes(&ids).await?
            }
        };

        for (piece, node) in segment.pieces.iter().zip(nodes) {
            let index = piece.piece_num as usize;
            if index < slots.len() {
                slots[index] = node;
            }
        }
        Ok(slots)
    }
}

fn make_scheme(redundancy: &RedundancyScheme) -> Result<Arc<dyn ErasureScheme>, PipelineError> {
    Ok(Arc::new(RsScheme::new(
        redundancy.required as usize,
        redundancy.total as usize,
        redundancy.share_size as usize,
    )?))
}

fn make_strategy(redundancy: &RedundancyScheme) -> Result<RedundancyStrategy, PipelineError> {
    Ok(RedundancyStrategy::new(
        make_scheme(redundancy)?,
        redundancy.repair as usize,
        redundancy.optimal as usize,
    )?)
}

fn make_remote_pointer(
    nodes: &[Option<NodeDescriptor>],
    strategy: &RedundancyStrategy,
    piece_id: PieceId,
    segment_size: i64,
    expiration: Timestamp,
    metadata: Vec<u8>,
) -> Pointer {
    let pieces: Vec<RemotePiece> = nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| {
            node.as_ref().map(|node| RemotePiece {
                piece_num: index as u32,
                node_id: node.id,
            })
        })
        .collect();

    debug!(pieces = pieces.len(), segment_size, "composing remote pointer");
    Pointer::remote(
        RemoteSegment {
            piece_id,
            redundancy: RedundancyScheme {
                required: strategy.required_count() as u32,
                repair: strategy.repair_threshold() as u32,
                optimal: strategy.optimal_threshold() as u32,
                total: strategy.total_count() as u32,
                share_size: strategy.share_size() as u32,
            },
            pieces,
        },
        segment_size,
        expiration,
        metadata,
    )
}
