//! Stripe verification against erasure codewords.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use orbit_core::pad::padded_size;
use orbit_core::ranger::Ranger;
use orbit_core::NodeId;
use orbit_erasure::{AuditShare, ErasureScheme, RsScheme};
use orbit_overlay::{OverlayCache, StatDb, UpdateRequest};
use orbit_piecestore::PieceStoreClient;

use crate::cursor::{AuditCursor, Stripe};
use crate::AuditError;

/// Outcome of one stripe audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Nodes whose share matched the codeword.
    pub success: Vec<NodeId>,
    /// Nodes whose share was downloaded but mutated.
    pub failed: Vec<NodeId>,
    /// Nodes that could not be reached or did not return the share.
    pub offline: Vec<NodeId>,
    /// Piece numbers whose shares were mutated.
    pub failed_piece_nums: Vec<usize>,
}

/// Downloads shares and checks them against the erasure codeword.
pub struct Verifier {
    client: PieceStoreClient,
    cache: Arc<OverlayCache>,
}

impl Verifier {
    /// Creates a verifier.
    pub fn new(client: PieceStoreClient, cache: Arc<OverlayCache>) -> Self {
        Self { client, cache }
    }

    /// Verifies one stripe.
    pub async fn verify(&self, stripe: &Stripe) -> Result<AuditReport, AuditError> {
        let segment = stripe
            .pointer
            .remote_segment()
            .ok_or_else(|| AuditError::NotAuditable("segment is inline".into()))?;

        let redundancy = segment.redundancy;
        let share_size = redundancy.share_size as usize;
        let total = redundancy.total as usize;
        let required = redundancy.required as usize;
        let stripe_size = redundancy.stripe_size();

        let padded = padded_size(stripe.pointer.segment_size, stripe_size);
        let piece_size = padded / required as i64;

        let ids: Vec<NodeId> = segment.pieces.iter().map(|p| p.node_id).collect();
        let nodes = self.cache.bulk_lookup(&ids)?;

        // Download this stripe's share from every listed piece.
        let mut shares: Vec<AuditShare> = (0..total).map(AuditShare::missing).collect();
        let mut holders: Vec<Option<NodeId>> = vec![None; total];
        let mut offline = Vec::new();
        let mut downloaded: Vec<usize> = Vec::new();

        for (piece, node) in segment.pieces.iter().zip(nodes) {
            let piece_num = piece.piece_num as usize;
            holders[piece_num] = Some(piece.node_id);

            let Some(node) = node else {
                offline.push(piece.node_id);
                continue;
            };

            let derived = segment.piece_id.derive(&node.id);
            let ranger = self.client.get(
                node.clone(),
                derived,
                piece_size,
                stripe.payer.clone(),
                stripe.authorization.clone(),
            );

            let offset = stripe.index * share_size as i64;
            let mut data = vec![0u8; share_size];
            let read = async {
                let mut reader = ranger.range(offset, share_size as i64).await?;
                reader.read_exact(&mut data).await?;
                Ok::<_, AuditError>(())
            }
            .await;

            match read {
                Ok(()) => {
                    shares[piece_num] = AuditShare::present(piece_num, data);
                    downloaded.push(piece_num);
                }
                Err(err) => {
                    debug!(node = %node.id, error = %err, "share download failed");
                    offline.push(piece.node_id);
                }
            }
        }

        if downloaded.len() < required {
            return Err(AuditError::Inconclusive(format!(
                "only {} of {} required shares downloaded",
                downloaded.len(),
                required
            )));
        }

        // Correction reproduces the codeword and flags disagreeing shares.
        let scheme = RsScheme::new(required, total, share_size)?;
        let failed_piece_nums = scheme.correct(&mut shares)?;

        let failed: Vec<NodeId> = failed_piece_nums
            .iter()
            .filter_map(|&num| holders.get(num).copied().flatten())
            .collect();
        let success: Vec<NodeId> = downloaded
            .iter()
            .filter(|num| !failed_piece_nums.contains(num))
            .filter_map(|&num| holders[num])
            .collect();

        Ok(AuditReport {
            success,
            failed,
            offline,
            failed_piece_nums,
        })
    }
}

/// The audit control loop: cursor, verifier, statistics reporting.
pub struct AuditService {
    cursor: AuditCursor,
    verifier: Verifier,
    statdb: Arc<StatDb>,
    cache: Arc<OverlayCache>,
    interval: Duration,
}

impl AuditService {
    /// Creates the service.
    pub fn new(
        cursor: AuditCursor,
        verifier: Verifier,
        statdb: Arc<StatDb>,
        cache: Arc<OverlayCache>,
        interval: Duration,
    ) -> Self {
        Self {
            cursor,
            verifier,
            statdb,
            cache,
            interval,
        }
    }

    /// Runs audits until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(Some(report)) => info!(
                            success = report.success.len(),
                            failed = report.failed.len(),
                            offline = report.offline.len(),
                            "audit complete"
                        ),
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "audit failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Audits one stripe and records the outcomes.
    pub async fn tick(&self) -> Result<Option<AuditReport>, AuditError> {
        let Some(stripe) = self.cursor.next_stripe().await? else {
            return Ok(None);
        };
        let report = self.verifier.verify(&stripe).await?;
        self.record(&report)?;
        Ok(Some(report))
    }

    /// Writes audit outcomes into the statistics store and refreshes the
    /// overlay cache's reputation copies.
    pub fn record(&self, report: &AuditReport) -> Result<(), AuditError> {
        let mut updates = Vec::new();
        for id in &report.success {
            updates.push(UpdateRequest::audit_success(*id));
        }
        for id in &report.failed {
            updates.push(UpdateRequest::audit_failure(*id));
        }
        for id in &report.offline {
            updates.push(UpdateRequest::offline(*id));
        }

        let (_, failed_nodes) = self.statdb.update_batch(&updates)?;
        if !failed_nodes.is_empty() {
            warn!(count = failed_nodes.len(), "some statistics updates failed");
        }

        for update in &updates {
            if let Ok(stats) = self.statdb.get(&update.node_id) {
                let _ = self.cache.update_reputation(&update.node_id, stats);
            }
        }
        Ok(())
    }
}
