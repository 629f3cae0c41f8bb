//! Pointer metadata: where a segment lives and how it is redundantly stored.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, NodeId, PieceId, Timestamp};

use crate::ProtoError;

/// Meta-flag bitfield selecting which pointer fields a listing includes.
pub mod meta_flags {
    /// No metadata.
    pub const NONE: u32 = 0;
    /// Creation time.
    pub const MODIFIED: u32 = 1 << 0;
    /// Expiration time.
    pub const EXPIRATION: u32 = 1 << 1;
    /// Segment size.
    pub const SIZE: u32 = 1 << 2;
    /// Caller-supplied metadata blob.
    pub const USER_DEFINED: u32 = 1 << 3;
    /// Everything.
    pub const ALL: u32 = MODIFIED | EXPIRATION | SIZE | USER_DEFINED;
}

/// Erasure parameters of a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Shares needed to recover a stripe (k).
    pub required: u32,
    /// Healthy-piece count below which the segment is repaired (r).
    pub repair: u32,
    /// Successful puts at which an upload stops early (o).
    pub optimal: u32,
    /// Total shares per stripe (n).
    pub total: u32,
    /// Share size in bytes (s).
    pub share_size: u32,
}

impl RedundancyScheme {
    /// Validates `1 <= k <= r <= o <= n <= 256` and a positive share size.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.required == 0 {
            return Err(ProtoError::Validation("required count must be positive".into()));
        }
        if !(self.required <= self.repair
            && self.repair <= self.optimal
            && self.optimal <= self.total)
        {
            return Err(ProtoError::Validation(format!(
                "thresholds must satisfy {} <= {} <= {} <= {}",
                self.required, self.repair, self.optimal, self.total
            )));
        }
        if self.total > 256 {
            return Err(ProtoError::Validation(format!(
                "total {} exceeds 256",
                self.total
            )));
        }
        if self.share_size == 0 {
            return Err(ProtoError::Validation("share size must be positive".into()));
        }
        Ok(())
    }

    /// Stripe size in bytes (k * s).
    pub fn stripe_size(&self) -> usize {
        self.required as usize * self.share_size as usize
    }
}

impl CanonicalEncode for RedundancyScheme {
    fn encode(&self, buf: &mut BytesMut) {
        self.required.encode(buf);
        self.repair.encode(buf);
        self.optimal.encode(buf);
        self.total.encode(buf);
        self.share_size.encode(buf);
    }
}

impl CanonicalDecode for RedundancyScheme {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            required: u32::decode(buf)?,
            repair: u32::decode(buf)?,
            optimal: u32::decode(buf)?,
            total: u32::decode(buf)?,
            share_size: u32::decode(buf)?,
        })
    }
}

/// One stored piece of a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePiece {
    /// Share index within the erasure codeword.
    pub piece_num: u32,
    /// Node holding the piece, resolved through the overlay.
    pub node_id: NodeId,
}

impl CanonicalEncode for RemotePiece {
    fn encode(&self, buf: &mut BytesMut) {
        self.piece_num.encode(buf);
        self.node_id.encode(buf);
    }
}

impl CanonicalDecode for RemotePiece {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            piece_num: u32::decode(buf)?,
            node_id: NodeId::decode(buf)?,
        })
    }
}

/// Location info for a remotely stored segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSegment {
    /// Base piece id; each node stores a per-node derivation of it.
    pub piece_id: PieceId,
    /// Erasure parameters.
    pub redundancy: RedundancyScheme,
    /// Pieces that were stored successfully, ordered by piece number.
    pub pieces: Vec<RemotePiece>,
}

impl CanonicalEncode for RemoteSegment {
    fn encode(&self, buf: &mut BytesMut) {
        self.piece_id.encode(buf);
        self.redundancy.encode(buf);
        self.pieces.encode(buf);
    }
}

impl CanonicalDecode for RemoteSegment {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            piece_id: PieceId::decode(buf)?,
            redundancy: RedundancyScheme::decode(buf)?,
            pieces: Vec::<RemotePiece>::decode(buf)?,
        })
    }
}

/// Where the segment's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentData {
    /// Short segments are stored directly in the pointer.
    Inline(Vec<u8>),
    /// Larger segments are erasure-coded across nodes.
    Remote(RemoteSegment),
}

impl SegmentData {
    const INLINE_TAG: u32 = 0;
    const REMOTE_TAG: u32 = 1;
}

impl CanonicalEncode for SegmentData {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            SegmentData::Inline(data) => {
                Self::INLINE_TAG.encode(buf);
                data.encode(buf);
            }
            SegmentData::Remote(segment) => {
                Self::REMOTE_TAG.encode(buf);
                segment.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for SegmentData {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::INLINE_TAG => Ok(SegmentData::Inline(Vec::<u8>::decode(buf)?)),
            Self::REMOTE_TAG => Ok(SegmentData::Remote(RemoteSegment::decode(buf)?)),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// The metadata record locating one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    /// Inline bytes or remote piece locations.
    pub segment: SegmentData,
    /// Exact unpadded segment size in bytes.
    pub segment_size: i64,
    /// Stamped by the pointer service on Put.
    pub creation: Timestamp,
    /// Optional expiration; unset means the segment never expires.
    pub expiration: Timestamp,
    /// Opaque caller metadata, never interpreted by the service.
    pub metadata: Vec<u8>,
}

impl Pointer {
    /// Builds an inline pointer around the literal segment bytes.
    pub fn inline(data: Vec<u8>, expiration: Timestamp, metadata: Vec<u8>) -> Self {
        let segment_size = data.len() as i64;
        Self {
            segment: SegmentData::Inline(data),
            segment_size,
            creation: Timestamp::unset(),
            expiration,
            metadata,
        }
    }

    /// Builds a remote pointer from a stored piece set.
    pub fn remote(
        segment: RemoteSegment,
        segment_size: i64,
        expiration: Timestamp,
        metadata: Vec<u8>,
    ) -> Self {
        Self {
            segment: SegmentData::Remote(segment),
            segment_size,
            creation: Timestamp::unset(),
            expiration,
            metadata,
        }
    }

    /// Returns the remote segment, if any.
    pub fn remote_segment(&self) -> Option<&RemoteSegment> {
        match &self.segment {
            SegmentData::Remote(segment) => Some(segment),
            SegmentData::Inline(_) => None,
        }
    }

    /// Returns the inline bytes, if any.
    pub fn inline_segment(&self) -> Option<&[u8]> {
        match &self.segment {
            SegmentData::Inline(data) => Some(data),
            SegmentData::Remote(_) => None,
        }
    }

    /// Checks structural invariants.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.segment_size < 0 {
            return Err(ProtoError::Validation(format!(
                "segment size {} is negative",
                self.segment_size
            )));
        }
        if let SegmentData::Remote(segment) = &self.segment {
            segment.redundancy.validate()?;
            let mut nums = std::collections::HashSet::new();
            let mut nodes = std::collections::HashSet::new();
            for piece in &segment.pieces {
                if piece.piece_num >= segment.redundancy.total {
                    return Err(ProtoError::Validation(format!(
                        "piece number {} out of range 0..{}",
                        piece.piece_num, segment.redundancy.total
                    )));
                }
                if !nums.insert(piece.piece_num) {
                    return Err(ProtoError::Validation(format!(
                        "duplicate piece number {}",
                        piece.piece_num
                    )));
                }
                if !nodes.insert(piece.node_id) {
                    return Err(ProtoError::Validation(format!(
                        "duplicate node {}",
                        piece.node_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns a copy stripped down to the fields selected by `flags`.
    pub fn with_meta_flags(&self, flags: u32) -> Pointer {
        Pointer {
            segment: SegmentData::Inline(Vec::new()),
            segment_size: if flags & meta_flags::SIZE != 0 {
                self.segment_size
            } else {
                0
            },
            creation: if flags & meta_flags::MODIFIED != 0 {
                self.creation
            } else {
                Timestamp::unset()
            },
            expiration: if flags & meta_flags::EXPIRATION != 0 {
                self.expiration
            } else {
                Timestamp::unset()
            },
            metadata: if flags & meta_flags::USER_DEFINED != 0 {
                self.metadata.clone()
            } else {
                Vec::new()
            },
        }
    }
}

impl CanonicalEncode for Pointer {
    fn encode(&self, buf: &mut BytesMut) {
        self.segment.encode(buf);
        self.segment_size.encode(buf);
        self.creation.encode(buf);
        self.expiration.encode(buf);
        self.metadata.encode(buf);
    }
}

impl CanonicalDecode for Pointer {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            segment: SegmentData::decode(buf)?,
            segment_size: i64::decode(buf)?,
            creation: Timestamp::decode(buf)?,
            expiration: Timestamp::decode(buf)?,
            metadata: Vec::<u8>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_scheme() -> RedundancyScheme {
        RedundancyScheme {
            required: 2,
            repair: 3,
            optimal: 3,
            total: 4,
            share_size: 1024,
        }
    }

    fn remote_pointer() -> Pointer {
        let pieces = (0..4)
            .map(|i| RemotePiece {
                piece_num: i,
                node_id: NodeId::random(),
            })
            .collect();
        Pointer::remote(
            RemoteSegment {
                piece_id: PieceId::random(),
                redundancy: test_scheme(),
                pieces,
            },
            4096,
            Timestamp::unset(),
            b"meta".to_vec(),
        )
    }

    #[test]
    fn test_pointer_roundtrip() {
        let pointer = remote_pointer();
        let decoded = Pointer::from_bytes(&pointer.to_vec()).unwrap();
        assert_eq!(pointer, decoded);

        let inline = Pointer::inline(b"hello".to_vec(), Timestamp::unset(), Vec::new());
        let decoded = Pointer::from_bytes(&inline.to_vec()).unwrap();
        assert_eq!(inline, decoded);
        assert_eq!(decoded.segment_size, 5);
    }

    #[test]
    fn test_redundancy_validation() {
        assert!(test_scheme().validate().is_ok());

        let mut bad = test_scheme();
        bad.repair = 1;
        assert!(bad.validate().is_err());

        let mut bad = test_scheme();
        bad.share_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = test_scheme();
        bad.required = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_pointer_rejects_duplicate_pieces() {
        let mut pointer = remote_pointer();
        if let SegmentData::Remote(segment) = &mut pointer.segment {
            segment.pieces[1].piece_num = 0;
        }
        assert!(pointer.validate().is_err());

        let mut pointer = remote_pointer();
        if let SegmentData::Remote(segment) = &mut pointer.segment {
            segment.pieces[1].node_id = segment.pieces[0].node_id;
        }
        assert!(pointer.validate().is_err());
    }

    #[test]
    fn test_meta_flags_projection() {
        let mut pointer = remote_pointer();
        pointer.creation = Timestamp::now();

        let none = pointer.with_meta_flags(meta_flags::NONE);
        assert_eq!(none.segment_size, 0);
        assert!(none.creation.is_unset());
        assert!(none.metadata.is_empty());

        let size_only = pointer.with_meta_flags(meta_flags::SIZE);
        assert_eq!(size_only.segment_size, 4096);
        assert!(size_only.creation.is_unset());

        let all = pointer.with_meta_flags(meta_flags::ALL);
        assert_eq!(all.segment_size, 4096);
        assert_eq!(all.creation, pointer.creation);
        assert_eq!(all.metadata, pointer.metadata);
    }

    #[test]
    fn test_piece_num_range_check() {
        let mut pointer = remote_pointer();
        if let SegmentData::Remote(segment) = &mut pointer.segment {
            segment.pieces[3].piece_num = 9;
        }
        assert!(pointer.validate().is_err());
    }
}
