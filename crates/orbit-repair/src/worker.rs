//! Repair worker: drains the queue and reconstructs segments.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use orbit_pipeline::{PipelineError, SegmentStore};

use crate::queue::RepairQueue;
use crate::RepairError;

/// Drains the repair queue, reconstructing one segment at a time.
pub struct RepairWorker {
    queue: Arc<RepairQueue>,
    segments: Arc<SegmentStore>,
    interval: Duration,
}

impl RepairWorker {
    /// Creates a worker.
    pub fn new(queue: Arc<RepairQueue>, segments: Arc<SegmentStore>, interval: Duration) -> Self {
        Self {
            queue,
            segments,
            interval,
        }
    }

    /// Runs the drain loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.drain().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "segments repaired"),
                        Err(err) => error!(error = %err, "repair drain failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Repairs every queued segment; returns how many succeeded.
    pub async fn drain(&self) -> Result<usize, RepairError> {
        let mut repaired = 0usize;
        while let Some(entry) = self.queue.dequeue()? {
            match self
                .segments
                .repair(&entry.path, &entry.lost_pieces)
                .await
            {
                Ok(()) => {
                    info!(path = %entry.path, lost = entry.lost_pieces.len(), "segment repaired");
                    repaired += 1;
                }
                Err(PipelineError::Unrecoverable { healthy, required }) => {
                    // Terminal; re-queueing would loop forever.
                    error!(
                        path = %entry.path,
                        healthy,
                        required,
                        "segment unrecoverable"
                    );
                }
                Err(err) => {
                    // Transient; put it back for the next tick.
                    warn!(path = %entry.path, error = %err, "repair failed, requeueing");
                    self.queue.enqueue(&entry)?;
                    break;
                }
            }
        }
        Ok(repaired)
    }
}
