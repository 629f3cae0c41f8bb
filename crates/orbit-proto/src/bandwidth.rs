//! Signed bandwidth allocations.
//!
//! The satellite issues a payer allocation per object operation; the uplink
//! countersigns a running total per segment. Storage nodes verify both
//! signatures, persist the latest valid allocation, and settle it back to
//! the satellite later.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use orbit_core::{
    sign, verify, CanonicalDecode, CanonicalEncode, DecodeError, Keypair, NodeId, SerialNumber,
    Timestamp,
};

use crate::ProtoError;

/// Direction of the paid transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthAction {
    /// Uplink pays to store bytes.
    Put,
    /// Uplink pays to retrieve bytes.
    Get,
}

impl BandwidthAction {
    fn tag(&self) -> u32 {
        match self {
            BandwidthAction::Put => 0,
            BandwidthAction::Get => 1,
        }
    }
}

impl CanonicalEncode for BandwidthAction {
    fn encode(&self, buf: &mut BytesMut) {
        self.tag().encode(buf);
    }
}

impl CanonicalDecode for BandwidthAction {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            0 => Ok(BandwidthAction::Put),
            1 => Ok(BandwidthAction::Get),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// Payload of a satellite-issued allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerAllocationData {
    /// Issuing satellite.
    pub satellite_id: NodeId,
    /// Uplink the allocation was issued to.
    pub uplink_id: NodeId,
    /// Paid action.
    pub action: BandwidthAction,
    /// Issuance time.
    pub created: Timestamp,
    /// Expiration; must be strictly in the future at issuance.
    pub expiration: Timestamp,
    /// Unique serial, one per issued allocation.
    pub serial: SerialNumber,
    /// Hard upper bound on the countersigned total, in bytes.
    pub max_size: i64,
    /// Uplink public key used to verify countersignatures.
    pub pub_key: [u8; 32],
}

impl CanonicalEncode for PayerAllocationData {
    fn encode(&self, buf: &mut BytesMut) {
        self.satellite_id.encode(buf);
        self.uplink_id.encode(buf);
        self.action.encode(buf);
        self.created.encode(buf);
        self.expiration.encode(buf);
        self.serial.encode(buf);
        self.max_size.encode(buf);
        self.pub_key.encode(buf);
    }
}

impl CanonicalDecode for PayerAllocationData {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            satellite_id: NodeId::decode(buf)?,
            uplink_id: NodeId::decode(buf)?,
            action: BandwidthAction::decode(buf)?,
            created: Timestamp::decode(buf)?,
            expiration: Timestamp::decode(buf)?,
            serial: SerialNumber::decode(buf)?,
            max_size: i64::decode(buf)?,
            pub_key: <[u8; 32]>::decode(buf)?,
        })
    }
}

/// A satellite-signed allocation: canonical payload bytes plus signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerBandwidthAllocation {
    /// Canonical encoding of [`PayerAllocationData`].
    pub data: Vec<u8>,
    /// Satellite signature over `data`.
    pub signature: Vec<u8>,
}

impl PayerBandwidthAllocation {
    /// Signs `data` with the satellite key.
    pub fn sign_with(keypair: &Keypair, data: &PayerAllocationData) -> Self {
        let bytes = data.to_vec();
        let signature = sign(keypair, &bytes);
        Self {
            data: bytes,
            signature,
        }
    }

    /// Decodes the payload.
    pub fn decode_data(&self) -> Result<PayerAllocationData, ProtoError> {
        Ok(PayerAllocationData::from_bytes(&self.data)?)
    }

    /// Verifies the satellite signature.
    pub fn verify(&self, satellite_key: &[u8; 32]) -> Result<PayerAllocationData, ProtoError> {
        verify(satellite_key, &self.data, &self.signature)?;
        self.decode_data()
    }
}

impl CanonicalEncode for PayerBandwidthAllocation {
    fn encode(&self, buf: &mut BytesMut) {
        self.data.encode(buf);
        self.signature.encode(buf);
    }
}

impl CanonicalDecode for PayerBandwidthAllocation {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            data: Vec::<u8>::decode(buf)?,
            signature: Vec::<u8>::decode(buf)?,
        })
    }
}

/// Payload of an uplink countersignature: the payer allocation plus the
/// cumulative byte total transferred so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenterAllocationData {
    /// The allocation being drawn against.
    pub payer: PayerBandwidthAllocation,
    /// Cumulative bytes; strictly monotonic within a session.
    pub total: i64,
}

impl CanonicalEncode for RenterAllocationData {
    fn encode(&self, buf: &mut BytesMut) {
        self.payer.encode(buf);
        self.total.encode(buf);
    }
}

impl CanonicalDecode for RenterAllocationData {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            payer: PayerBandwidthAllocation::decode(buf)?,
            total: i64::decode(buf)?,
        })
    }
}

/// An uplink-countersigned allocation update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenterBandwidthAllocation {
    /// Canonical encoding of [`RenterAllocationData`].
    pub data: Vec<u8>,
    /// Uplink signature over `data`.
    pub signature: Vec<u8>,
}

impl RenterBandwidthAllocation {
    /// Countersigns a new cumulative total with the uplink key.
    pub fn sign_with(keypair: &Keypair, payer: PayerBandwidthAllocation, total: i64) -> Self {
        let data = RenterAllocationData { payer, total };
        let bytes = data.to_vec();
        let signature = sign(keypair, &bytes);
        Self {
            data: bytes,
            signature,
        }
    }

    /// Decodes the payload.
    pub fn decode_data(&self) -> Result<RenterAllocationData, ProtoError> {
        Ok(RenterAllocationData::from_bytes(&self.data)?)
    }

    /// Verifies the countersignature against the uplink key embedded in the
    /// payer allocation, then returns the payload.
    pub fn verify(&self) -> Result<RenterAllocationData, ProtoError> {
        let data = self.decode_data()?;
        let payer = data.payer.decode_data()?;
        verify(&payer.pub_key, &self.data, &self.signature)?;
        Ok(data)
    }
}

impl CanonicalEncode for RenterBandwidthAllocation {
    fn encode(&self, buf: &mut BytesMut) {
        self.data.encode(buf);
        self.signature.encode(buf);
    }
}

impl CanonicalDecode for RenterBandwidthAllocation {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            data: Vec::<u8>::decode(buf)?,
            signature: Vec::<u8>::decode(buf)?,
        })
    }
}

/// A signed authorization accompanying piece requests.
///
/// The satellite signs its own identity bytes; storage nodes verify the
/// signature against their configured satellite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    /// Signed payload.
    pub data: Vec<u8>,
    /// Signature over `data`.
    pub signature: Vec<u8>,
    /// Signer public key.
    pub pub_key: [u8; 32],
}

impl SignedMessage {
    /// Signs `data` with `keypair`.
    pub fn sign_with(keypair: &Keypair, data: Vec<u8>) -> Self {
        let signature = sign(keypair, &data);
        Self {
            data,
            signature,
            pub_key: keypair.public_key(),
        }
    }

    /// Verifies the signature against the embedded public key.
    pub fn verify(&self) -> Result<(), ProtoError> {
        verify(&self.pub_key, &self.data, &self.signature)?;
        Ok(())
    }
}

impl CanonicalEncode for SignedMessage {
    fn encode(&self, buf: &mut BytesMut) {
        self.data.encode(buf);
        self.signature.encode(buf);
        self.pub_key.encode(buf);
    }
}

impl CanonicalDecode for SignedMessage {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            data: Vec::<u8>::decode(buf)?,
            signature: Vec::<u8>::decode(buf)?,
            pub_key: <[u8; 32]>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn payer_allocation(satellite: &Keypair, uplink: &Keypair) -> PayerBandwidthAllocation {
        let data = PayerAllocationData {
            satellite_id: NodeId::random(),
            uplink_id: NodeId::random(),
            action: BandwidthAction::Get,
            created: Timestamp::now(),
            expiration: Timestamp::now().plus(Duration::from_secs(3600)),
            serial: SerialNumber::random(),
            max_size: 1 << 30,
            pub_key: uplink.public_key(),
        };
        PayerBandwidthAllocation::sign_with(satellite, &data)
    }

    #[test]
    fn test_payer_allocation_verifies() {
        let satellite = Keypair::generate();
        let uplink = Keypair::generate();
        let pba = payer_allocation(&satellite, &uplink);

        let data = pba.verify(&satellite.public_key()).unwrap();
        assert_eq!(data.action, BandwidthAction::Get);

        assert!(pba.verify(&Keypair::generate().public_key()).is_err());
    }

    #[test]
    fn test_renter_countersignature_chain() {
        let satellite = Keypair::generate();
        let uplink = Keypair::generate();
        let pba = payer_allocation(&satellite, &uplink);

        let rba = RenterBandwidthAllocation::sign_with(&uplink, pba, 4096);
        let data = rba.verify().unwrap();
        assert_eq!(data.total, 4096);
    }

    #[test]
    fn test_renter_signature_by_wrong_key_fails() {
        let satellite = Keypair::generate();
        let uplink = Keypair::generate();
        let intruder = Keypair::generate();
        let pba = payer_allocation(&satellite, &uplink);

        let rba = RenterBandwidthAllocation::sign_with(&intruder, pba, 4096);
        assert!(rba.verify().is_err());
    }

    #[test]
    fn test_tampered_total_fails() {
        let satellite = Keypair::generate();
        let uplink = Keypair::generate();
        let pba = payer_allocation(&satellite, &uplink);

        let mut rba = RenterBandwidthAllocation::sign_with(&uplink, pba, 4096);
        // Raise the total without re-signing.
        let mut data = rba.decode_data().unwrap();
        data.total = 1 << 40;
        rba.data = data.to_vec();
        assert!(rba.verify().is_err());
    }

    #[test]
    fn test_signed_message() {
        let keypair = Keypair::generate();
        let msg = SignedMessage::sign_with(&keypair, b"satellite-id".to_vec());
        msg.verify().unwrap();

        let mut tampered = msg.clone();
        tampered.data = b"other".to_vec();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_allocation_roundtrip() {
        let satellite = Keypair::generate();
        let uplink = Keypair::generate();
        let pba = payer_allocation(&satellite, &uplink);
        let rba = RenterBandwidthAllocation::sign_with(&uplink, pba.clone(), 100);

        assert_eq!(
            PayerBandwidthAllocation::from_bytes(&pba.to_vec()).unwrap(),
            pba
        );
        assert_eq!(
            RenterBandwidthAllocation::from_bytes(&rba.to_vec()).unwrap(),
            rba
        );
    }
}
