//! Injured segment detection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use orbit_core::{ApiKey, NodeId, LOOKUP_LIMIT};
use orbit_overlay::OverlayCache;
use orbit_pointerdb::PointerDb;
use orbit_proto::Pointer;

use crate::queue::{InjuredSegment, RepairQueue};
use crate::RepairError;

/// Scans pointers for segments below their repair threshold.
pub struct Checker {
    pointers: Arc<PointerDb>,
    api_key: ApiKey,
    cache: Arc<OverlayCache>,
    queue: Arc<RepairQueue>,
    limit: usize,
    interval: Duration,
}

impl Checker {
    /// Creates a checker scanning at most `limit` pointers per tick.
    pub fn new(
        pointers: Arc<PointerDb>,
        api_key: ApiKey,
        cache: Arc<OverlayCache>,
        queue: Arc<RepairQueue>,
        limit: usize,
        interval: Duration,
    ) -> Self {
        Self {
            pointers,
            api_key,
            cache,
            queue,
            limit,
            interval,
        }
    }

    /// Runs the check loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.identify_injured_segments() {
                        Ok(0) => {}
                        Ok(count) => info!(count, "segments queued for repair"),
                        Err(err) => error!(error = %err, "checker failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One bounded scan; returns how many segments were enqueued.
    pub fn identify_injured_segments(&self) -> Result<usize, RepairError> {
        let limit = if self.limit == 0 || self.limit > LOOKUP_LIMIT {
            LOOKUP_LIMIT
        } else {
            self.limit
        };

        let mut scanned = 0usize;
        let mut candidates: Vec<(String, Pointer)> = Vec::new();
        self.pointers
            .iterate(&self.api_key, "", &mut |path, pointer| {
                scanned += 1;
                if pointer.remote_segment().is_some() {
                    candidates.push((path.to_string(), pointer.clone()));
                }
                scanned < limit
            })?;

        let mut enqueued = 0usize;
        for (path, pointer) in candidates {
            let segment = pointer.remote_segment().expect("filtered to remote");

            let ids: Vec<NodeId> = segment.pieces.iter().map(|p| p.node_id).collect();
            let resolved = self.cache.bulk_lookup(&ids)?;

            let mut missing: Vec<u32> = Vec::new();
            for (piece, node) in segment.pieces.iter().zip(&resolved) {
                if node.is_none() || node.as_ref().is_some_and(|n| n.unreachable) {
                    missing.push(piece.piece_num);
                }
            }

            let healthy = ids.len() - missing.len();
            if (healthy as u32) < segment.redundancy.repair {
                debug!(path, healthy, "segment below repair threshold");
                self.queue.enqueue(&InjuredSegment {
                    path,
                    lost_pieces: missing,
                })?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}
