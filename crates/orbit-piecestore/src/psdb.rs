//! Node-local database: piece TTLs, bandwidth usage, stored allocations.
//!
//! Key layout on the ordered store:
//! - `ttl/<piece id>`            -> TtlEntry
//! - `bw/used/<unix day, 10 digits>` -> i64 bytes
//! - `agree/<satellite hex>/<serial hex>` -> RenterBandwidthAllocation

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, NodeId, SerialNumber, Timestamp};
use orbit_kv::{KeyValueStore, KvError};
use orbit_proto::RenterBandwidthAllocation;

use crate::PieceStoreError;

const TTL_PREFIX: &str = "ttl/";
const BW_PREFIX: &str = "bw/used/";
const AGREEMENT_PREFIX: &str = "agree/";

/// TTL row for one stored piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlEntry {
    /// When the piece may be garbage collected; unset means never.
    pub expiration: Timestamp,
    /// Stored piece size in bytes.
    pub size: i64,
    /// When the piece was stored.
    pub created: Timestamp,
}

impl CanonicalEncode for TtlEntry {
    fn encode(&self, buf: &mut BytesMut) {
        self.expiration.encode(buf);
        self.size.encode(buf);
        self.created.encode(buf);
    }
}

impl CanonicalDecode for TtlEntry {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            expiration: Timestamp::decode(buf)?,
            size: i64::decode(buf)?,
            created: Timestamp::decode(buf)?,
        })
    }
}

/// Persistent node-local bookkeeping.
#[derive(Clone)]
pub struct PieceDb {
    store: Arc<dyn KeyValueStore>,
}

impl PieceDb {
    /// Wraps an ordered store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn ttl_key(id: &str) -> Vec<u8> {
        format!("{TTL_PREFIX}{id}").into_bytes()
    }

    fn bw_key(day: i64) -> Vec<u8> {
        format!("{BW_PREFIX}{day:010}").into_bytes()
    }

    fn agreement_key(satellite: &NodeId, serial: &SerialNumber) -> Vec<u8> {
        format!("{AGREEMENT_PREFIX}{}/{}", satellite.to_hex(), serial.to_hex()).into_bytes()
    }

    /// Records the TTL row for a freshly stored piece.
    pub fn add_ttl(
        &self,
        id: &str,
        expiration: Timestamp,
        size: i64,
    ) -> Result<(), PieceStoreError> {
        let entry = TtlEntry {
            expiration,
            size,
            created: Timestamp::now(),
        };
        self.store.put(&Self::ttl_key(id), &entry.to_vec())?;
        Ok(())
    }

    /// Looks up the TTL row of a piece.
    pub fn get_ttl(&self, id: &str) -> Result<TtlEntry, PieceStoreError> {
        match self.store.get(&Self::ttl_key(id)) {
            Ok(raw) => Ok(TtlEntry::from_bytes(&raw)
                .map_err(|e| PieceStoreError::Validation(e.to_string()))?),
            Err(KvError::NotFound) => Err(PieceStoreError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the TTL row of a piece.
    pub fn delete_ttl(&self, id: &str) -> Result<(), PieceStoreError> {
        self.store.delete(&Self::ttl_key(id))?;
        Ok(())
    }

    /// Sums the sizes of every piece currently under TTL.
    pub fn sum_ttl_sizes(&self) -> Result<i64, PieceStoreError> {
        let mut total = 0i64;
        let mut bad_row = None;
        self.store.iterate(TTL_PREFIX.as_bytes(), &mut |key, value| {
            if !key.starts_with(TTL_PREFIX.as_bytes()) {
                return false;
            }
            match TtlEntry::from_bytes(value) {
                Ok(entry) => total += entry.size,
                Err(err) => {
                    bad_row = Some(err);
                    return false;
                }
            }
            true
        })?;
        if let Some(err) = bad_row {
            return Err(PieceStoreError::Validation(err.to_string()));
        }
        Ok(total)
    }

    /// Returns ids of every piece whose TTL expired before `now`.
    pub fn expired_pieces(&self, now: Timestamp) -> Result<Vec<String>, PieceStoreError> {
        let mut expired = Vec::new();
        self.store.iterate(TTL_PREFIX.as_bytes(), &mut |key, value| {
            if !key.starts_with(TTL_PREFIX.as_bytes()) {
                return false;
            }
            if let Ok(entry) = TtlEntry::from_bytes(value) {
                if !entry.expiration.is_unset() && entry.expiration <= now {
                    if let Ok(id) = std::str::from_utf8(&key[TTL_PREFIX.len()..]) {
                        expired.push(id.to_string());
                    }
                }
            }
            true
        })?;
        Ok(expired)
    }

    /// Adds transferred bytes to today's bandwidth counter.
    pub fn add_bandwidth_used(&self, amount: i64) -> Result<(), PieceStoreError> {
        let day = Timestamp::now().as_secs() / 86_400;
        let key = Self::bw_key(day);
        let current = match self.store.get(&key) {
            Ok(raw) => i64::from_bytes(&raw).unwrap_or(0),
            Err(KvError::NotFound) => 0,
            Err(err) => return Err(err.into()),
        };
        self.store.put(&key, &(current + amount).to_vec())?;
        Ok(())
    }

    /// Sums bandwidth used since `since`.
    pub fn bandwidth_used_since(&self, since: Timestamp) -> Result<i64, PieceStoreError> {
        let first_day = since.as_secs() / 86_400;
        let mut total = 0i64;
        self.store
            .iterate(&Self::bw_key(first_day), &mut |key, value| {
                if !key.starts_with(BW_PREFIX.as_bytes()) {
                    return false;
                }
                total += i64::from_bytes(value).unwrap_or(0);
                true
            })?;
        Ok(total)
    }

    /// Persists the latest valid allocation for later settlement.
    pub fn write_allocation(
        &self,
        satellite: &NodeId,
        serial: &SerialNumber,
        allocation: &RenterBandwidthAllocation,
    ) -> Result<(), PieceStoreError> {
        self.store
            .put(&Self::agreement_key(satellite, serial), &allocation.to_vec())?;
        Ok(())
    }

    /// Returns stored allocations grouped by satellite.
    pub fn allocations_by_satellite(
        &self,
    ) -> Result<HashMap<NodeId, Vec<(SerialNumber, RenterBandwidthAllocation)>>, PieceStoreError>
    {
        let mut groups: HashMap<NodeId, Vec<(SerialNumber, RenterBandwidthAllocation)>> =
            HashMap::new();
        let mut bad_row = None;
        self.store
            .iterate(AGREEMENT_PREFIX.as_bytes(), &mut |key, value| {
                if !key.starts_with(AGREEMENT_PREFIX.as_bytes()) {
                    return false;
                }
                let rest = &key[AGREEMENT_PREFIX.len()..];
                let Some(slash) = rest.iter().position(|&b| b == b'/') else {
                    return true;
                };
                let satellite = std::str::from_utf8(&rest[..slash])
                    .ok()
                    .and_then(|s| NodeId::from_hex(s).ok());
                let serial = std::str::from_utf8(&rest[slash + 1..])
                    .ok()
                    .and_then(|s| SerialNumber::from_hex(s).ok());
                let (Some(satellite), Some(serial)) = (satellite, serial) else {
                    return true;
                };
                match RenterBandwidthAllocation::from_bytes(value) {
                    Ok(allocation) => {
                        groups.entry(satellite).or_default().push((serial, allocation));
                    }
                    Err(err) => {
                        bad_row = Some(err);
                        return false;
                    }
                }
                true
            })?;
        if let Some(err) = bad_row {
            return Err(PieceStoreError::Validation(err.to_string()));
        }
        Ok(groups)
    }

    /// Deletes a settled allocation.
    pub fn delete_allocation(
        &self,
        satellite: &NodeId,
        serial: &SerialNumber,
    ) -> Result<(), PieceStoreError> {
        self.store.delete(&Self::agreement_key(satellite, serial))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::Keypair;
    use orbit_kv::MemoryStore;
    use orbit_proto::{BandwidthAction, PayerAllocationData, PayerBandwidthAllocation};

    fn db() -> PieceDb {
        PieceDb::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_ttl_lifecycle() {
        let db = db();
        db.add_ttl("piece-a-0123456789abcdef", Timestamp::unset(), 100).unwrap();
        db.add_ttl("piece-b-0123456789abcdef", Timestamp::new(1), 250).unwrap();

        assert_eq!(db.get_ttl("piece-a-0123456789abcdef").unwrap().size, 100);
        assert_eq!(db.sum_ttl_sizes().unwrap(), 350);

        let expired = db.expired_pieces(Timestamp::now()).unwrap();
        assert_eq!(expired, vec!["piece-b-0123456789abcdef".to_string()]);

        db.delete_ttl("piece-b-0123456789abcdef").unwrap();
        assert_eq!(db.sum_ttl_sizes().unwrap(), 100);
        assert!(matches!(
            db.get_ttl("piece-b-0123456789abcdef"),
            Err(PieceStoreError::NotFound)
        ));
    }

    #[test]
    fn test_bandwidth_accumulates() {
        let db = db();
        db.add_bandwidth_used(1000).unwrap();
        db.add_bandwidth_used(500).unwrap();

        let since_epoch = db.bandwidth_used_since(Timestamp::new(0)).unwrap();
        assert_eq!(since_epoch, 1500);
    }

    #[test]
    fn test_allocation_grouping() {
        let db = db();
        let satellite_a = NodeId::random();
        let satellite_b = NodeId::random();
        let uplink = Keypair::generate();
        let satellite_key = Keypair::generate();

        let mut write = |satellite: &NodeId, total: i64| {
            let serial = SerialNumber::random();
            let payer = PayerBandwidthAllocation::sign_with(
                &satellite_key,
                &PayerAllocationData {
                    satellite_id: *satellite,
                    uplink_id: NodeId::random(),
                    action: BandwidthAction::Put,
                    created: Timestamp::now(),
                    expiration: Timestamp::now(),
                    serial,
                    max_size: 1 << 20,
                    pub_key: uplink.public_key(),
                },
            );
            let rba = RenterBandwidthAllocation::sign_with(&uplink, payer, total);
            db.write_allocation(satellite, &serial, &rba).unwrap();
            serial
        };

        write(&satellite_a, 100);
        write(&satellite_a, 200);
        let serial_b = write(&satellite_b, 300);

        let groups = db.allocations_by_satellite().unwrap();
        assert_eq!(groups[&satellite_a].len(), 2);
        assert_eq!(groups[&satellite_b].len(), 1);

        db.delete_allocation(&satellite_b, &serial_b).unwrap();
        let groups = db.allocations_by_satellite().unwrap();
        assert!(!groups.contains_key(&satellite_b));
    }
}
