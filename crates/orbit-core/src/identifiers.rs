//! Identifier types used throughout Orbit.
//!
//! - `NodeId` - storage node / satellite identity (32 bytes)
//! - `PieceId` - segment piece identifier, derived per node before storage
//! - `SerialNumber` - unique id of a bandwidth allocation

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// Macro to define a 32-byte identifier type with common implementations.
macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Creates a new identifier from a 32-byte array.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Creates a zero identifier.
            pub const fn zero() -> Self {
                Self([0u8; 32])
            }

            /// Returns true when every byte is zero.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Returns the inner bytes as a slice.
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Creates from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Returns as a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Generates a random identifier.
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl CanonicalEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                self.0.encode(buf);
            }
        }

        impl CanonicalDecode for $name {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                Ok(Self(<[u8; 32]>::decode(buf)?))
            }
        }
    };
}

define_id_type!(
    /// Storage node or satellite identity.
    ///
    /// The 256-bit id space doubles as the Kademlia key space.
    NodeId
);

define_id_type!(
    /// Identifier of an erasure-coded segment's piece set (random 32 bytes).
    ///
    /// Nodes never see this id directly; they see a per-node derivation.
    PieceId
);

define_id_type!(
    /// Unique serial of a payer bandwidth allocation.
    SerialNumber
);

impl NodeId {
    /// Computes XOR distance for Kademlia routing.
    pub fn xor_distance(&self, other: &Self) -> [u8; 32] {
        let mut result = [0u8; 32];
        for i in 0..32 {
            result[i] = self.0[i] ^ other.0[i];
        }
        result
    }

    /// Returns the leading zero bits count (for k-bucket indexing).
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl PieceId {
    /// Derives the piece name a specific node stores this piece under.
    ///
    /// `derived = SHA-256(piece_id || node_id)`, so a node learns nothing
    /// about which other nodes hold sibling pieces.
    pub fn derive(&self, node_id: &NodeId) -> PieceId {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(node_id.0);
        let digest = hasher.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        PieceId(arr)
    }

    /// Applies a storage namespace, yielding the on-disk piece name.
    ///
    /// Empty namespaces leave the id unchanged.
    pub fn namespaced(&self, namespace: &[u8]) -> PieceId {
        if namespace.is_empty() {
            return *self;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(namespace);
        let digest = hasher.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        PieceId(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_PIECE_ID_LENGTH;

    #[test]
    fn test_xor_distance() {
        let id1 = NodeId::new([0xFF; 32]);
        let id2 = NodeId::new([0x00; 32]);
        assert_eq!(id1.xor_distance(&id2), [0xFF; 32]);
        assert_eq!(id1.xor_distance(&id1), [0x00; 32]);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(NodeId::new([0x00; 32]).leading_zeros(), 256);

        let mut bytes = [0x00; 32];
        bytes[0] = 0x80;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 0);

        bytes[0] = 0x01;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 7);
    }

    #[test]
    fn test_piece_derivation_is_per_node() {
        let piece = PieceId::random();
        let n1 = NodeId::random();
        let n2 = NodeId::random();

        assert_ne!(piece.derive(&n1), piece.derive(&n2));
        assert_eq!(piece.derive(&n1), piece.derive(&n1));
        assert_ne!(piece.derive(&n1), piece);
    }

    #[test]
    fn test_rendered_id_meets_minimum_length() {
        let piece = PieceId::random();
        assert!(piece.to_hex().len() >= MIN_PIECE_ID_LENGTH);
    }

    #[test]
    fn test_namespaced_empty_is_identity() {
        let piece = PieceId::random();
        assert_eq!(piece.namespaced(b""), piece);
        assert_ne!(piece.namespaced(b"tenant-a"), piece);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_canonical_roundtrip() {
        let id = PieceId::random();
        let decoded = PieceId::from_bytes(&id.to_vec()).unwrap();
        assert_eq!(id, decoded);
    }
}
