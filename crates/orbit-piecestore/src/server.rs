//! Piece session server.
//!
//! Each accepted session carries exactly one operation: a streaming Store, a
//! throttled Retrieve, a Delete, or a Stat. Budgets are enforced against the
//! node's committed space and a rolling bandwidth window; partial uploads
//! are rolled back.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use orbit_core::{NodeId, PieceId, Timestamp};
use orbit_kv::KeyValueStore;
use orbit_net::Channel;
use orbit_proto::{
    BandwidthAction, ErrorKind, PayerAllocationData, PayerBandwidthAllocation, PieceRequest,
    PieceResponse, RenterBandwidthAllocation, SignedMessage,
};

use crate::psdb::PieceDb;
use crate::pstore::PieceStorage;
use crate::throttle::{Throttle, ThrottleError};
use crate::{PieceStoreError, MESSAGE_SIZE};

/// Rolling window used for the bandwidth budget.
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

/// Storage node configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's identity.
    pub node_id: NodeId,
    /// Piece directory root.
    pub piece_dir: PathBuf,
    /// Disk bytes committed to the network.
    pub space_allocated: i64,
    /// Bandwidth bytes committed per window.
    pub bandwidth_allocated: i64,
    /// When set, only authorizations signed by this key are accepted.
    pub satellite_key: Option<[u8; 32]>,
}

/// Snapshot of the node's capacity usage.
#[derive(Debug, Clone, Copy)]
pub struct SpaceReport {
    /// Bytes of pieces currently stored.
    pub space_used: i64,
    /// Remaining committed disk.
    pub space_available: i64,
    /// Bandwidth used inside the current window.
    pub bandwidth_used: i64,
    /// Remaining committed bandwidth.
    pub bandwidth_available: i64,
}

/// The storage-node piece server.
pub struct PieceStoreServer {
    config: ServerConfig,
    storage: PieceStorage,
    db: PieceDb,
}

impl PieceStoreServer {
    /// Creates a server over the given database store.
    pub fn new(config: ServerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let storage = PieceStorage::new(config.piece_dir.clone());
        Self {
            config,
            storage,
            db: PieceDb::new(store),
        }
    }

    /// The node-local database.
    pub fn db(&self) -> &PieceDb {
        &self.db
    }

    /// The piece directory.
    pub fn storage(&self) -> &PieceStorage {
        &self.storage
    }

    /// Accepts sessions until the acceptor closes.
    pub async fn run(self: Arc<Self>, mut acceptor: mpsc::UnboundedReceiver<Channel>) {
        while let Some(channel) = acceptor.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_session(channel).await;
            });
        }
    }

    /// Accepts sessions from a bounded acceptor (TCP listener).
    pub async fn run_bounded(self: Arc<Self>, mut acceptor: mpsc::Receiver<Channel>) {
        while let Some(channel) = acceptor.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_session(channel).await;
            });
        }
    }

    /// Periodically deletes pieces whose TTL expired.
    pub async fn run_ttl_sweep(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_expired().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "expired pieces removed"),
                        Err(err) => error!(error = %err, "ttl sweep failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Deletes every piece whose TTL expired, returning how many.
    pub async fn sweep_expired(&self) -> Result<usize, PieceStoreError> {
        let expired = self.db.expired_pieces(Timestamp::now())?;
        let count = expired.len();
        for id in expired {
            self.storage.delete(&id).await?;
            self.db.delete_ttl(&id)?;
        }
        Ok(count)
    }

    /// Reports capacity usage for the dashboard surface.
    pub fn space_report(&self) -> Result<SpaceReport, PieceStoreError> {
        let space_used = self.db.sum_ttl_sizes()?;
        let bandwidth_used = self
            .db
            .bandwidth_used_since(window_start())?;
        Ok(SpaceReport {
            space_used,
            space_available: self.config.space_allocated - space_used,
            bandwidth_used,
            bandwidth_available: self.config.bandwidth_allocated - bandwidth_used,
        })
    }

    /// Handles one session from its first frame.
    pub async fn handle_session(self: &Arc<Self>, mut channel: Channel) {
        let first = match channel.recv_msg::<PieceRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "undecodable session header");
                return;
            }
        };

        let result = match first {
            PieceRequest::StoreHeader {
                piece_id,
                expiration,
                namespace,
                authorization,
                payer,
            } => {
                self.handle_store(&mut channel, piece_id, expiration, &namespace, &authorization, &payer)
                    .await
            }
            PieceRequest::RetrieveHeader {
                piece_id,
                offset,
                length,
                authorization,
                payer,
            } => {
                self.handle_retrieve(channel, piece_id, offset, length, &authorization, &payer)
                    .await;
                return;
            }
            PieceRequest::Delete {
                piece_id,
                authorization,
            } => self.handle_delete(&mut channel, piece_id, &authorization).await,
            PieceRequest::Stat { piece_id } => self.handle_stat(&mut channel, piece_id).await,
            other => Err(PieceStoreError::Validation(format!(
                "unexpected session-opening frame: {other:?}"
            ))),
        };

        if let Err(err) = result {
            warn!(error = %err, "session failed");
            let _ = channel
                .send_msg(&PieceResponse::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                })
                .await;
        }
    }

    fn verify_authorization(&self, authorization: &SignedMessage) -> Result<(), PieceStoreError> {
        authorization
            .verify()
            .map_err(|e| PieceStoreError::Unauthenticated(e.to_string()))?;
        if let Some(expected) = &self.config.satellite_key {
            if authorization.pub_key != *expected {
                return Err(PieceStoreError::Unauthenticated(
                    "authorization signed by unknown satellite".into(),
                ));
            }
        }
        Ok(())
    }

    fn verify_payer(
        &self,
        payer: &PayerBandwidthAllocation,
        action: BandwidthAction,
    ) -> Result<PayerAllocationData, PieceStoreError> {
        let data = payer
            .decode_data()
            .map_err(|e| PieceStoreError::Integrity(e.to_string()))?;
        if data.action != action {
            return Err(PieceStoreError::Unauthenticated(format!(
                "allocation action {:?} does not permit {:?}",
                data.action, action
            )));
        }
        if data.expiration.is_expired() {
            return Err(PieceStoreError::Unauthenticated("allocation expired".into()));
        }
        Ok(data)
    }

    async fn handle_store(
        &self,
        channel: &mut Channel,
        piece_id: PieceId,
        expiration: Timestamp,
        namespace: &[u8],
        authorization: &SignedMessage,
        payer: &PayerBandwidthAllocation,
    ) -> Result<(), PieceStoreError> {
        self.verify_authorization(authorization)?;
        let payer_data = self.verify_payer(payer, BandwidthAction::Put)?;

        let id = piece_id.namespaced(namespace).to_hex();
        debug!(piece = %&id[..8], "storing piece");

        let space_left = self.config.space_allocated - self.db.sum_ttl_sizes()?;
        let bandwidth_left =
            self.config.bandwidth_allocated - self.db.bandwidth_used_since(window_start())?;

        let mut file = self.storage.writer(&id).await?;

        let result = self
            .receive_store_payload(
                channel,
                &mut file,
                payer,
                &payer_data,
                space_left,
                bandwidth_left,
            )
            .await;

        let (total, last_allocation) = match result {
            Ok(parts) => parts,
            Err(err) => {
                // Roll back the partial upload.
                drop(file);
                let _ = self.storage.delete(&id).await;
                let _ = self.db.delete_ttl(&id);
                return Err(err);
            }
        };

        file.flush().await?;
        drop(file);

        if let Err(err) = self.db.add_ttl(&id, expiration, total) {
            let _ = self.storage.delete(&id).await;
            return Err(err);
        }
        if let Some(allocation) = last_allocation {
            self.db
                .write_allocation(&payer_data.satellite_id, &payer_data.serial, &allocation)?;
        }
        self.db.add_bandwidth_used(total)?;

        debug!(piece = %&id[..8], total, "stored piece");
        channel
            .send_msg(&PieceResponse::StoreSummary {
                message: "OK".into(),
                total_received: total,
            })
            .await?;
        Ok(())
    }

    async fn receive_store_payload(
        &self,
        channel: &mut Channel,
        file: &mut tokio::fs::File,
        payer: &PayerBandwidthAllocation,
        payer_data: &PayerAllocationData,
        space_left: i64,
        bandwidth_left: i64,
    ) -> Result<(i64, Option<RenterBandwidthAllocation>), PieceStoreError> {
        let mut total = 0i64;
        let mut last_total = 0i64;
        let mut last_allocation = None;

        loop {
            match channel.recv_msg::<PieceRequest>().await? {
                Some(PieceRequest::StoreChunk {
                    content,
                    allocation,
                }) => {
                    if let Some(allocation) = allocation {
                        let data = allocation
                            .verify()
                            .map_err(|e| PieceStoreError::Integrity(e.to_string()))?;
                        if data.payer.data != payer.data {
                            return Err(PieceStoreError::Integrity(
                                "allocation drawn against a different payer allocation".into(),
                            ));
                        }
                        if data.total < last_total {
                            return Err(PieceStoreError::Integrity(format!(
                                "allocation total decreased: {} after {}",
                                data.total, last_total
                            )));
                        }
                        if data.total > payer_data.max_size {
                            return Err(PieceStoreError::OutOfBandwidth);
                        }
                        if data.total > last_total {
                            last_total = data.total;
                            last_allocation = Some(allocation);
                        }
                    }

                    total += content.len() as i64;
                    if total > space_left {
                        return Err(PieceStoreError::OutOfSpace);
                    }
                    if total > bandwidth_left {
                        return Err(PieceStoreError::OutOfBandwidth);
                    }
                    file.write_all(&content).await?;
                }
                Some(PieceRequest::StoreDone) => return Ok((total, last_allocation)),
                Some(other) => {
                    return Err(PieceStoreError::Validation(format!(
                        "unexpected frame during store: {other:?}"
                    )))
                }
                None => return Err(PieceStoreError::UnexpectedEof),
            }
        }
    }

    async fn handle_retrieve(
        self: &Arc<Self>,
        channel: Channel,
        piece_id: PieceId,
        offset: i64,
        length: i64,
        authorization: &SignedMessage,
        payer: &PayerBandwidthAllocation,
    ) {
        let outcome = self
            .retrieve_inner(channel, piece_id, offset, length, authorization, payer)
            .await;
        if let Err(err) = outcome {
            warn!(error = %err, "retrieve failed");
        }
    }

    async fn retrieve_inner(
        self: &Arc<Self>,
        channel: Channel,
        piece_id: PieceId,
        offset: i64,
        length: i64,
        authorization: &SignedMessage,
        payer: &PayerBandwidthAllocation,
    ) -> Result<(), PieceStoreError> {
        let (tx, mut rx) = channel.split();

        let setup: Result<_, PieceStoreError> = async {
            self.verify_authorization(authorization)?;
            let payer_data = self.verify_payer(payer, BandwidthAction::Get)?;
            let (reader, to_read) = self.storage.reader(&piece_id.to_hex(), offset, length).await?;
            Ok((payer_data, reader, to_read))
        }
        .await;

        let (payer_data, mut reader, to_read) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                let response = PieceResponse::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                let _ = send_frame(&tx, &response).await;
                return Err(err);
            }
        };

        let throttle = Arc::new(Throttle::new());
        let allocated = Arc::new(AtomicI64::new(0));

        // Allocation receiver: produces throttle budget as countersigned
        // totals arrive, and records the final allocation once the client
        // side closes.
        {
            let server = self.clone();
            let throttle = throttle.clone();
            let allocated = allocated.clone();
            let payer_bytes = payer.data.clone();
            let payer_data = payer_data.clone();
            tokio::spawn(async move {
                let mut last_total = 0i64;
                let mut last_allocation: Option<RenterBandwidthAllocation> = None;

                while let Some(frame) = rx.recv().await {
                    let request = match PieceRequest::from_bytes(&frame) {
                        Ok(request) => request,
                        Err(err) => {
                            throttle.fail(ThrottleError::new(
                                ErrorKind::Validation,
                                err.to_string(),
                            ));
                            break;
                        }
                    };
                    let PieceRequest::RetrieveAllocation { allocation } = request else {
                        continue;
                    };

                    let data = match allocation.verify() {
                        Ok(data) => data,
                        Err(err) => {
                            throttle
                                .fail(ThrottleError::new(ErrorKind::Integrity, err.to_string()));
                            break;
                        }
                    };
                    if data.payer.data != payer_bytes {
                        throttle.fail(ThrottleError::new(
                            ErrorKind::Integrity,
                            "allocation drawn against a different payer allocation",
                        ));
                        break;
                    }
                    if data.total < last_total {
                        throttle.fail(ThrottleError::new(
                            ErrorKind::Integrity,
                            format!("allocation total decreased: {} after {}", data.total, last_total),
                        ));
                        break;
                    }
                    if data.total > payer_data.max_size {
                        throttle.fail(ThrottleError::new(
                            ErrorKind::OutOfBandwidth,
                            "allocation exceeds the payer cap",
                        ));
                        break;
                    }

                    let delta = data.total - last_total;
                    last_total = data.total;
                    allocated.store(last_total, Ordering::SeqCst);
                    last_allocation = Some(allocation);
                    if throttle.produce(delta).is_err() {
                        break;
                    }
                }

                if let Some(allocation) = last_allocation {
                    if let Err(err) = server.db.write_allocation(
                        &payer_data.satellite_id,
                        &payer_data.serial,
                        &allocation,
                    ) {
                        error!(error = %err, "failed recording allocation");
                    }
                }
            });
        }

        // Data send loop.
        let mut used = 0i64;
        let mut failure: Option<ThrottleError> = None;
        while used < to_read {
            let granted = match throttle.consume_or_wait(MESSAGE_SIZE as i64).await {
                Ok(granted) => granted,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            let want = granted.min(to_read - used);
            if granted > want {
                let _ = throttle.produce(granted - want);
            }

            let mut chunk = vec![0u8; want as usize];
            reader.read_exact(&mut chunk).await?;
            used += want;

            send_frame(&tx, &PieceResponse::RetrieveChunk { content: chunk }).await?;
        }

        self.db.add_bandwidth_used(used)?;

        match failure {
            Some(err) => {
                let _ = send_frame(
                    &tx,
                    &PieceResponse::Error {
                        kind: err.kind,
                        message: err.message.clone(),
                    },
                )
                .await;
                Err(PieceStoreError::Integrity(err.message))
            }
            None => {
                send_frame(
                    &tx,
                    &PieceResponse::RetrieveEnd {
                        retrieved: used,
                        allocated: allocated.load(Ordering::SeqCst),
                    },
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn handle_delete(
        &self,
        channel: &mut Channel,
        piece_id: PieceId,
        authorization: &SignedMessage,
    ) -> Result<(), PieceStoreError> {
        self.verify_authorization(authorization)?;
        let id = piece_id.to_hex();
        self.storage.delete(&id).await?;
        self.db.delete_ttl(&id)?;
        channel.send_msg(&PieceResponse::DeleteSummary).await?;
        Ok(())
    }

    async fn handle_stat(
        &self,
        channel: &mut Channel,
        piece_id: PieceId,
    ) -> Result<(), PieceStoreError> {
        let entry = self.db.get_ttl(&piece_id.to_hex())?;
        channel
            .send_msg(&PieceResponse::StatSummary {
                size: entry.size,
                expiration: entry.expiration,
            })
            .await?;
        Ok(())
    }
}

fn window_start() -> Timestamp {
    Timestamp::new(Timestamp::now().as_millis() - BANDWIDTH_WINDOW.as_millis() as i64)
}

async fn send_frame(
    tx: &mpsc::Sender<Bytes>,
    response: &PieceResponse,
) -> Result<(), PieceStoreError> {
    use orbit_core::CanonicalEncode;
    tx.send(response.to_bytes())
        .await
        .map_err(|_| PieceStoreError::UnexpectedEof)
}
