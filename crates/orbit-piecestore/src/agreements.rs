//! Bandwidth agreement settlement.
//!
//! Storage nodes batch their stored allocations per satellite at a check
//! interval, stream them back, and delete acknowledged rows. Failures are
//! retried at the next tick. The satellite side records verified
//! allocations for later payment calculation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use orbit_core::NodeId;
use orbit_kv::KeyValueStore;
use orbit_net::{Channel, Transport};
use orbit_proto::{NodeDescriptor, RenterBandwidthAllocation};

use crate::psdb::PieceDb;
use crate::PieceStoreError;

/// Resolves a satellite id to a dialable descriptor.
pub type SatelliteResolver = Arc<dyn Fn(NodeId) -> Option<NodeDescriptor> + Send + Sync>;

/// Periodically ships stored allocations to their satellites.
pub struct AgreementSender {
    db: PieceDb,
    transport: Arc<dyn Transport>,
    resolver: SatelliteResolver,
    check_interval: Duration,
}

impl AgreementSender {
    /// Creates a sender.
    pub fn new(
        db: PieceDb,
        transport: Arc<dyn Transport>,
        resolver: SatelliteResolver,
        check_interval: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            resolver,
            check_interval,
        }
    }

    /// Runs the settlement loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("agreement sender starting up");
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.send_pending().await {
                        Ok(0) => {}
                        Ok(sent) => debug!(sent, "settled agreements"),
                        Err(err) => warn!(error = %err, "agreement settlement failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Sends every stored allocation, grouped per satellite.
    ///
    /// Rows are deleted only after a successful send, so failures are
    /// naturally retried on the next tick.
    pub async fn send_pending(&self) -> Result<usize, PieceStoreError> {
        let groups = self.db.allocations_by_satellite()?;
        let mut sent = 0usize;

        for (satellite, allocations) in groups {
            let Some(node) = (self.resolver)(satellite) else {
                warn!(satellite = %satellite, "cannot resolve satellite for settlement");
                continue;
            };

            let channel = match self.transport.dial(&node).await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(satellite = %satellite, error = %err, "settlement dial failed");
                    continue;
                }
            };

            debug!(satellite = %satellite, count = allocations.len(), "sending agreements");
            for (serial, allocation) in allocations {
                if channel.send_msg(&allocation).await.is_err() {
                    break;
                }
                self.db.delete_allocation(&satellite, &serial)?;
                sent += 1;
            }
        }

        Ok(sent)
    }
}

const SETTLED_PREFIX: &str = "settled/";

/// Satellite-side receiver recording settled allocations.
pub struct AgreementReceiver {
    store: Arc<dyn KeyValueStore>,
}

impl AgreementReceiver {
    /// Creates a receiver over the satellite's store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Drains one settlement session, recording every verifiable allocation.
    pub async fn handle_session(&self, mut channel: Channel) {
        loop {
            match channel.recv_msg::<RenterBandwidthAllocation>().await {
                Ok(Some(allocation)) => {
                    if let Err(err) = self.record(&allocation) {
                        warn!(error = %err, "rejected settled allocation");
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "undecodable settlement frame");
                    return;
                }
            }
        }
    }

    /// Verifies and stores one allocation, keyed by serial.
    pub fn record(&self, allocation: &RenterBandwidthAllocation) -> Result<(), PieceStoreError> {
        use orbit_core::CanonicalEncode;

        let data = allocation
            .verify()
            .map_err(|e| PieceStoreError::Integrity(e.to_string()))?;
        let payer = data
            .payer
            .decode_data()
            .map_err(|e| PieceStoreError::Integrity(e.to_string()))?;

        let key = format!("{SETTLED_PREFIX}{}", payer.serial.to_hex());
        self.store.put(key.as_bytes(), &allocation.to_vec())?;
        Ok(())
    }

    /// Number of recorded settlements.
    pub fn settled_count(&self) -> Result<usize, PieceStoreError> {
        let mut count = 0usize;
        self.store
            .iterate(SETTLED_PREFIX.as_bytes(), &mut |key, _| {
                if !key.starts_with(SETTLED_PREFIX.as_bytes()) {
                    return false;
                }
                count += 1;
                true
            })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::{Keypair, SerialNumber, Timestamp};
    use orbit_kv::MemoryStore;
    use orbit_net::LocalTransport;
    use orbit_proto::{
        BandwidthAction, NodeAddress, PayerAllocationData, PayerBandwidthAllocation,
    };

    fn allocation(
        satellite_key: &Keypair,
        uplink: &Keypair,
        satellite_id: NodeId,
        total: i64,
    ) -> (SerialNumber, RenterBandwidthAllocation) {
        let serial = SerialNumber::random();
        let payer = PayerBandwidthAllocation::sign_with(
            satellite_key,
            &PayerAllocationData {
                satellite_id,
                uplink_id: NodeId::random(),
                action: BandwidthAction::Put,
                created: Timestamp::now(),
                expiration: Timestamp::now(),
                serial,
                max_size: 1 << 30,
                pub_key: uplink.public_key(),
            },
        );
        (
            serial,
            RenterBandwidthAllocation::sign_with(uplink, payer, total),
        )
    }

    #[tokio::test]
    async fn test_settlement_roundtrip() {
        let transport = LocalTransport::new();
        let satellite_id = NodeId::random();
        let satellite_key = Keypair::generate();
        let uplink = Keypair::generate();

        // Satellite side.
        let receiver = Arc::new(AgreementReceiver::new(Arc::new(MemoryStore::new())));
        let mut acceptor = transport.listen(satellite_id);
        {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                while let Some(channel) = acceptor.recv().await {
                    receiver.handle_session(channel).await;
                }
            });
        }

        // Node side.
        let db = PieceDb::new(Arc::new(MemoryStore::new()));
        for total in [100, 200, 300] {
            let (serial, rba) = allocation(&satellite_key, &uplink, satellite_id, total);
            db.write_allocation(&satellite_id, &serial, &rba).unwrap();
        }

        let descriptor = NodeDescriptor::new(satellite_id, NodeAddress::new("local"));
        let resolver: SatelliteResolver = Arc::new(move |id| {
            (id == satellite_id).then(|| descriptor.clone())
        });

        let sender = AgreementSender::new(
            db.clone(),
            Arc::new(transport),
            resolver,
            Duration::from_secs(3600),
        );

        assert_eq!(sender.send_pending().await.unwrap(), 3);
        assert!(db.allocations_by_satellite().unwrap().is_empty());

        // The receiver processes frames asynchronously.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(receiver.settled_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_satellite_is_retried_later() {
        let transport = LocalTransport::new();
        let satellite_id = NodeId::random();
        let satellite_key = Keypair::generate();
        let uplink = Keypair::generate();

        let db = PieceDb::new(Arc::new(MemoryStore::new()));
        let (serial, rba) = allocation(&satellite_key, &uplink, satellite_id, 42);
        db.write_allocation(&satellite_id, &serial, &rba).unwrap();

        let resolver: SatelliteResolver = Arc::new(|_| None);
        let sender = AgreementSender::new(
            db.clone(),
            Arc::new(transport),
            resolver,
            Duration::from_secs(3600),
        );

        assert_eq!(sender.send_pending().await.unwrap(), 0);
        // Row is still there for the next tick.
        assert_eq!(db.allocations_by_satellite().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_receiver_rejects_bad_signature() {
        let receiver = AgreementReceiver::new(Arc::new(MemoryStore::new()));
        let satellite_key = Keypair::generate();
        let uplink = Keypair::generate();
        let intruder = Keypair::generate();

        let (_, mut rba) = allocation(&satellite_key, &uplink, NodeId::random(), 7);
        rba.signature = intruder.sign(&rba.data);

        assert!(receiver.record(&rba).is_err());
        assert_eq!(receiver.settled_count().unwrap(), 0);
    }
}
