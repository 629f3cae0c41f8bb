//! Piece-store session messages.
//!
//! A piece session is a bidirectional frame stream. Store interleaves
//! payload chunks with countersigned allocation updates; Retrieve streams
//! chunks back against allocation updates flowing the other way.

use bytes::{Bytes, BytesMut};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, PieceId, Timestamp};

use crate::bandwidth::{PayerBandwidthAllocation, RenterBandwidthAllocation, SignedMessage};

/// Error classification carried in wire errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    /// Missing or invalid authorization.
    Unauthenticated = 0,
    /// The requested entity does not exist.
    NotFound = 1,
    /// A request failed validation.
    Validation = 2,
    /// The node is out of committed disk space.
    OutOfSpace = 3,
    /// The node is out of committed bandwidth.
    OutOfBandwidth = 4,
    /// Signature or content integrity failure.
    Integrity = 5,
    /// The peer canceled the session.
    Canceled = 6,
    /// Unclassified server failure.
    Internal = 7,
}

impl ErrorKind {
    /// Returns the wire tag.
    pub fn tag(&self) -> u32 {
        *self as u32
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(ErrorKind::Unauthenticated),
            1 => Ok(ErrorKind::NotFound),
            2 => Ok(ErrorKind::Validation),
            3 => Ok(ErrorKind::OutOfSpace),
            4 => Ok(ErrorKind::OutOfBandwidth),
            5 => Ok(ErrorKind::Integrity),
            6 => Ok(ErrorKind::Canceled),
            7 => Ok(ErrorKind::Internal),
            other => Err(DecodeError::InvalidEnumTag(other)),
        }
    }
}

impl CanonicalEncode for ErrorKind {
    fn encode(&self, buf: &mut BytesMut) {
        self.tag().encode(buf);
    }
}

impl CanonicalDecode for ErrorKind {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Self::from_tag(u32::decode(buf)?)
    }
}

/// Frames sent by the client side of a piece session.
#[derive(Debug, Clone, PartialEq)]
pub enum PieceRequest {
    /// Opens a Store session.
    StoreHeader {
        /// Piece id as the node will store it (already derived).
        piece_id: PieceId,
        /// TTL; unset means the piece never expires.
        expiration: Timestamp,
        /// Storage namespace; empty for the default namespace.
        namespace: Vec<u8>,
        /// Satellite authorization.
        authorization: SignedMessage,
        /// Allocation being drawn against.
        payer: PayerBandwidthAllocation,
    },
    /// A payload chunk, optionally with a fresh allocation total.
    StoreChunk {
        /// Piece bytes.
        content: Vec<u8>,
        /// Countersigned cumulative total covering everything sent so far.
        allocation: Option<RenterBandwidthAllocation>,
    },
    /// Marks the end of the Store payload.
    StoreDone,
    /// Opens a Retrieve session.
    RetrieveHeader {
        /// Derived piece id.
        piece_id: PieceId,
        /// Starting byte offset.
        offset: i64,
        /// Bytes requested; negative means the rest of the piece.
        length: i64,
        /// Satellite authorization.
        authorization: SignedMessage,
        /// Allocation being drawn against.
        payer: PayerBandwidthAllocation,
    },
    /// Grants the server more bandwidth during a Retrieve.
    RetrieveAllocation {
        /// Countersigned cumulative total.
        allocation: RenterBandwidthAllocation,
    },
    /// Deletes a piece.
    Delete {
        /// Derived piece id.
        piece_id: PieceId,
        /// Satellite authorization.
        authorization: SignedMessage,
    },
    /// Requests piece metadata.
    Stat {
        /// Derived piece id.
        piece_id: PieceId,
    },
}

impl PieceRequest {
    const STORE_HEADER: u32 = 0;
    const STORE_CHUNK: u32 = 1;
    const STORE_DONE: u32 = 2;
    const RETRIEVE_HEADER: u32 = 3;
    const RETRIEVE_ALLOCATION: u32 = 4;
    const DELETE: u32 = 5;
    const STAT: u32 = 6;
}

impl CanonicalEncode for PieceRequest {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PieceRequest::StoreHeader {
                piece_id,
                expiration,
                namespace,
                authorization,
                payer,
            } => {
                Self::STORE_HEADER.encode(buf);
                piece_id.encode(buf);
                expiration.encode(buf);
                namespace.encode(buf);
                authorization.encode(buf);
                payer.encode(buf);
            }
            PieceRequest::StoreChunk {
                content,
                allocation,
            } => {
                Self::STORE_CHUNK.encode(buf);
                content.encode(buf);
                allocation.encode(buf);
            }
            PieceRequest::StoreDone => Self::STORE_DONE.encode(buf),
            PieceRequest::RetrieveHeader {
                piece_id,
                offset,
                length,
                authorization,
                payer,
            } => {
                Self::RETRIEVE_HEADER.encode(buf);
                piece_id.encode(buf);
                offset.encode(buf);
                length.encode(buf);
                authorization.encode(buf);
                payer.encode(buf);
            }
            PieceRequest::RetrieveAllocation { allocation } => {
                Self::RETRIEVE_ALLOCATION.encode(buf);
                allocation.encode(buf);
            }
            PieceRequest::Delete {
                piece_id,
                authorization,
            } => {
                Self::DELETE.encode(buf);
                piece_id.encode(buf);
                authorization.encode(buf);
            }
            PieceRequest::Stat { piece_id } => {
                Self::STAT.encode(buf);
                piece_id.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for PieceRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::STORE_HEADER => Ok(PieceRequest::StoreHeader {
                piece_id: PieceId::decode(buf)?,
                expiration: Timestamp::decode(buf)?,
                namespace: Vec::<u8>::decode(buf)?,
                authorization: SignedMessage::decode(buf)?,
                payer: PayerBandwidthAllocation::decode(buf)?,
            }),
            Self::STORE_CHUNK => Ok(PieceRequest::StoreChunk {
                content: Vec::<u8>::decode(buf)?,
                allocation: Option::<RenterBandwidthAllocation>::decode(buf)?,
            }),
            Self::STORE_DONE => Ok(PieceRequest::StoreDone),
            Self::RETRIEVE_HEADER => Ok(PieceRequest::RetrieveHeader {
                piece_id: PieceId::decode(buf)?,
                offset: i64::decode(buf)?,
                length: i64::decode(buf)?,
                authorization: SignedMessage::decode(buf)?,
                payer: PayerBandwidthAllocation::decode(buf)?,
            }),
            Self::RETRIEVE_ALLOCATION => Ok(PieceRequest::RetrieveAllocation {
                allocation: RenterBandwidthAllocation::decode(buf)?,
            }),
            Self::DELETE => Ok(PieceRequest::Delete {
                piece_id: PieceId::decode(buf)?,
                authorization: SignedMessage::decode(buf)?,
            }),
            Self::STAT => Ok(PieceRequest::Stat {
                piece_id: PieceId::decode(buf)?,
            }),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// Frames sent by the server side of a piece session.
#[derive(Debug, Clone, PartialEq)]
pub enum PieceResponse {
    /// Acknowledges a completed Store.
    StoreSummary {
        /// Human-readable status, "OK" on success.
        message: String,
        /// Bytes the node accepted and persisted.
        total_received: i64,
    },
    /// A chunk of retrieved piece content.
    RetrieveChunk {
        /// Piece bytes.
        content: Vec<u8>,
    },
    /// Marks the end of a Retrieve stream.
    RetrieveEnd {
        /// Bytes actually sent.
        retrieved: i64,
        /// Bytes the client allocated in total.
        allocated: i64,
    },
    /// Acknowledges a Delete.
    DeleteSummary,
    /// Piece metadata.
    StatSummary {
        /// Stored piece size in bytes.
        size: i64,
        /// Recorded TTL.
        expiration: Timestamp,
    },
    /// Terminal error.
    Error {
        /// Classification.
        kind: ErrorKind,
        /// Details.
        message: String,
    },
}

impl PieceResponse {
    const STORE_SUMMARY: u32 = 0;
    const RETRIEVE_CHUNK: u32 = 1;
    const RETRIEVE_END: u32 = 2;
    const DELETE_SUMMARY: u32 = 3;
    const STAT_SUMMARY: u32 = 4;
    const ERROR: u32 = 5;
}

impl CanonicalEncode for PieceResponse {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PieceResponse::StoreSummary {
                message,
                total_received,
            } => {
                Self::STORE_SUMMARY.encode(buf);
                message.encode(buf);
                total_received.encode(buf);
            }
            PieceResponse::RetrieveChunk { content } => {
                Self::RETRIEVE_CHUNK.encode(buf);
                content.encode(buf);
            }
            PieceResponse::RetrieveEnd {
                retrieved,
                allocated,
            } => {
                Self::RETRIEVE_END.encode(buf);
                retrieved.encode(buf);
                allocated.encode(buf);
            }
            PieceResponse::DeleteSummary => Self::DELETE_SUMMARY.encode(buf),
            PieceResponse::StatSummary { size, expiration } => {
                Self::STAT_SUMMARY.encode(buf);
                size.encode(buf);
                expiration.encode(buf);
            }
            PieceResponse::Error { kind, message } => {
                Self::ERROR.encode(buf);
                kind.encode(buf);
                message.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for PieceResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::STORE_SUMMARY => Ok(PieceResponse::StoreSummary {
                message: String::decode(buf)?,
                total_received: i64::decode(buf)?,
            }),
            Self::RETRIEVE_CHUNK => Ok(PieceResponse::RetrieveChunk {
                content: Vec::<u8>::decode(buf)?,
            }),
            Self::RETRIEVE_END => Ok(PieceResponse::RetrieveEnd {
                retrieved: i64::decode(buf)?,
                allocated: i64::decode(buf)?,
            }),
            Self::DELETE_SUMMARY => Ok(PieceResponse::DeleteSummary),
            Self::STAT_SUMMARY => Ok(PieceResponse::StatSummary {
                size: i64::decode(buf)?,
                expiration: Timestamp::decode(buf)?,
            }),
            Self::ERROR => Ok(PieceResponse::Error {
                kind: ErrorKind::decode(buf)?,
                message: String::decode(buf)?,
            }),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::{BandwidthAction, PayerAllocationData};
    use orbit_core::{Keypair, NodeId, SerialNumber};

    fn sample_payer() -> PayerBandwidthAllocation {
        let satellite = Keypair::generate();
        PayerBandwidthAllocation::sign_with(
            &satellite,
            &PayerAllocationData {
                satellite_id: NodeId::random(),
                uplink_id: NodeId::random(),
                action: BandwidthAction::Put,
                created: Timestamp::now(),
                expiration: Timestamp::now(),
                serial: SerialNumber::random(),
                max_size: 1024,
                pub_key: satellite.public_key(),
            },
        )
    }

    #[test]
    fn test_request_roundtrips() {
        let keypair = Keypair::generate();
        let auth = SignedMessage::sign_with(&keypair, b"sat".to_vec());
        let requests = vec![
            PieceRequest::StoreHeader {
                piece_id: PieceId::random(),
                expiration: Timestamp::now(),
                namespace: b"ns".to_vec(),
                authorization: auth.clone(),
                payer: sample_payer(),
            },
            PieceRequest::StoreChunk {
                content: vec![1, 2, 3],
                allocation: None,
            },
            PieceRequest::StoreDone,
            PieceRequest::RetrieveHeader {
                piece_id: PieceId::random(),
                offset: 100,
                length: -1,
                authorization: auth.clone(),
                payer: sample_payer(),
            },
            PieceRequest::Delete {
                piece_id: PieceId::random(),
                authorization: auth,
            },
            PieceRequest::Stat {
                piece_id: PieceId::random(),
            },
        ];

        for request in requests {
            let decoded = PieceRequest::from_bytes(&request.to_vec()).unwrap();
            assert_eq!(request, decoded);
        }
    }

    #[test]
    fn test_response_roundtrips() {
        let responses = vec![
            PieceResponse::StoreSummary {
                message: "OK".into(),
                total_received: 4096,
            },
            PieceResponse::RetrieveChunk {
                content: vec![9; 64],
            },
            PieceResponse::RetrieveEnd {
                retrieved: 64,
                allocated: 128,
            },
            PieceResponse::DeleteSummary,
            PieceResponse::StatSummary {
                size: 77,
                expiration: Timestamp::unset(),
            },
            PieceResponse::Error {
                kind: ErrorKind::OutOfSpace,
                message: "out of space".into(),
            },
        ];

        for response in responses {
            let decoded = PieceResponse::from_bytes(&response.to_vec()).unwrap();
            assert_eq!(response, decoded);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        99u32.encode(&mut buf);
        assert!(PieceRequest::from_bytes(&buf).is_err());
        assert!(PieceResponse::from_bytes(&buf).is_err());
    }
}
