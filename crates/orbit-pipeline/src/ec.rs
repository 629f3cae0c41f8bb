//! Erasure-coded piece dispersal and retrieval across storage nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use orbit_core::pad::padded_size;
use orbit_core::ranger::{check_range, RangeReader, Ranger, RangerError};
use orbit_core::{PieceId, Timestamp};
use orbit_erasure::{ErasureScheme, RedundancyStrategy};
use orbit_piecestore::PieceStoreClient;
use orbit_proto::{NodeDescriptor, PayerBandwidthAllocation, SignedMessage};

use crate::encode::encode_shares;
use crate::PipelineError;

/// Waits until a watch flag turns true; pends forever if the sender is gone.
async fn flagged(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum PutOutcome {
    Stored,
    Failed,
    Canceled,
}

/// Client storing and fetching erasure-coded segments.
#[derive(Clone)]
pub struct EcClient {
    client: PieceStoreClient,
    max_buffer_memory: usize,
}

impl EcClient {
    /// Creates a client with the given encoder buffer budget.
    pub fn new(client: PieceStoreClient, max_buffer_memory: usize) -> Self {
        Self {
            client,
            max_buffer_memory,
        }
    }

    /// Disperses `data` as one piece per node.
    ///
    /// `nodes` must have exactly `n` slots ordered by piece number; `None`
    /// slots are skipped but still count toward the success threshold (the
    /// repair path passes survivors as skips). Once successes reach the
    /// optimal threshold the remaining puts are canceled and their shares
    /// drained. Fewer successes than the repair threshold fails the upload
    /// and deletes whatever was stored; so does flipping `cancel`.
    ///
    /// Returns the node list filtered to successful positions.
    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        nodes: &[Option<NodeDescriptor>],
        strategy: &RedundancyStrategy,
        piece_id: PieceId,
        data: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        expiration: Timestamp,
        payer: &PayerBandwidthAllocation,
        authorization: &SignedMessage,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<Option<NodeDescriptor>>, PipelineError> {
        if nodes.len() != strategy.total_count() {
            return Err(PipelineError::Validation(format!(
                "{} nodes for an erasure scheme of total count {}",
                nodes.len(),
                strategy.total_count()
            )));
        }
        let mut ids = HashSet::new();
        for node in nodes.iter().flatten() {
            if !ids.insert(node.id) {
                return Err(PipelineError::Validation(format!(
                    "duplicate node {}",
                    node.id
                )));
            }
        }

        let readers = encode_shares(data, strategy, self.max_buffer_memory);
        let skips = nodes.iter().filter(|n| n.is_none()).count();
        let optimal = strategy.optimal_threshold();

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<(usize, PutOutcome)>();
        let (optimal_tx, optimal_rx) = watch::channel(false);

        let mut active = 0usize;
        for (index, (slot, mut reader)) in nodes.iter().zip(readers).enumerate() {
            let Some(node) = slot.clone() else {
                // Unused share; dropping the reader tells the encoder to
                // discard it.
                continue;
            };
            active += 1;

            let client = self.client.clone();
            let payer = payer.clone();
            let authorization = authorization.clone();
            let derived = piece_id.derive(&node.id);
            let report = report_tx.clone();
            let optimal_rx = optimal_rx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    result = client.put(
                        &node,
                        derived,
                        expiration,
                        &mut reader,
                        &payer,
                        &authorization,
                    ) => match result {
                        Ok(_) => PutOutcome::Stored,
                        Err(err) => {
                            warn!(node = %node.id, error = %err, "piece put failed");
                            PutOutcome::Failed
                        }
                    },
                    _ = flagged(optimal_rx) => PutOutcome::Canceled,
                    _ = flagged(cancel) => PutOutcome::Canceled,
                };
                let _ = report.send((index, outcome));
            });
        }
        drop(report_tx);

        let mut stored: Vec<Option<NodeDescriptor>> = vec![None; nodes.len()];
        let mut stored_count = 0usize;
        for _ in 0..active {
            let Some((index, outcome)) = report_rx.recv().await else {
                break;
            };
            if matches!(outcome, PutOutcome::Stored) {
                stored[index] = nodes[index].clone();
                stored_count += 1;
                if stored_count + skips >= optimal {
                    let _ = optimal_tx.send(true);
                }
            }
        }

        if *cancel.borrow() {
            debug!("upload canceled; deleting partial pieces");
            let _ = self.delete(nodes, piece_id, authorization).await;
            return Err(PipelineError::Canceled);
        }

        let successes = stored_count + skips;
        if successes < strategy.repair_threshold() {
            let _ = self.delete(&stored, piece_id, authorization).await;
            return Err(PipelineError::NotEnoughSuccesses {
                got: successes,
                needed: strategy.repair_threshold(),
            });
        }

        debug!(stored = stored_count, skips, "segment dispersed");
        Ok(stored)
    }

    /// Returns a lazy ranger over the decoded (still padded) ciphertext.
    ///
    /// `segment_size` is the unpadded ciphertext size; piece readers dial on
    /// their first range request and up to `n - k` may fail or stall.
    pub fn get(
        &self,
        nodes: &[Option<NodeDescriptor>],
        scheme: Arc<dyn ErasureScheme>,
        piece_id: PieceId,
        segment_size: i64,
        payer: &PayerBandwidthAllocation,
        authorization: &SignedMessage,
    ) -> Result<Arc<dyn Ranger>, PipelineError> {
        let available = nodes.iter().flatten().count();
        if available < scheme.required_count() {
            return Err(PipelineError::Unrecoverable {
                healthy: available,
                required: scheme.required_count(),
            });
        }

        let padded = padded_size(segment_size, scheme.stripe_size());
        let piece_size = padded / scheme.required_count() as i64;

        let mut rangers: HashMap<usize, Arc<dyn Ranger>> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            let derived = piece_id.derive(&node.id);
            let ranger = self.client.get(
                node.clone(),
                derived,
                piece_size,
                payer.clone(),
                authorization.clone(),
            );
            rangers.insert(index, Arc::new(ranger));
        }

        let decoded = crate::decode::DecodedRanger::new(rangers, scheme, padded)?;
        Ok(Arc::new(UnpadRanger {
            inner: decoded,
            size: segment_size,
        }))
    }

    /// Best-effort delete of the segment's pieces from every listed node.
    ///
    /// Fails only when every delete failed.
    pub async fn delete(
        &self,
        nodes: &[Option<NodeDescriptor>],
        piece_id: PieceId,
        authorization: &SignedMessage,
    ) -> Result<(), PipelineError> {
        let targets: Vec<NodeDescriptor> = nodes.iter().flatten().cloned().collect();
        if targets.is_empty() {
            return Ok(());
        }

        let mut tasks = tokio::task::JoinSet::new();
        for node in targets {
            let client = self.client.clone();
            let authorization = authorization.clone();
            let derived = piece_id.derive(&node.id);
            tasks.spawn(async move {
                let result = client.delete(&node, derived, &authorization).await;
                if let Err(err) = &result {
                    warn!(node = %node.id, error = %err, "piece delete failed");
                }
                result.is_ok()
            });
        }

        let mut any_ok = false;
        let mut count = 0usize;
        while let Some(joined) = tasks.join_next().await {
            count += 1;
            if matches!(joined, Ok(true)) {
                any_ok = true;
            }
        }

        if !any_ok && count > 0 {
            return Err(PipelineError::Validation(
                "every piece delete failed".into(),
            ));
        }
        Ok(())
    }
}

/// Exposes the unpadded ciphertext over the padded decoded ranger.
struct UnpadRanger {
    inner: crate::decode::DecodedRanger,
    size: i64,
}

#[async_trait::async_trait]
impl Ranger for UnpadRanger {
    fn size(&self) -> i64 {
        self.size
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.size)?;
        self.inner.range(offset, length).await
    }
}
