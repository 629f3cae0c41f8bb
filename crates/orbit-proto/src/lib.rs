//! Orbit Proto - Wire data model shared by uplinks, storage nodes, and the
//! satellite.
//!
//! Everything here carries a canonical encoding because pointers are
//! persisted by bytes, allocations are signed over their bytes, and piece
//! sessions frame these structures onto the network.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bandwidth;
pub mod bucket;
pub mod messages;
pub mod node;
pub mod pointer;

pub use bandwidth::{
    BandwidthAction, PayerAllocationData, PayerBandwidthAllocation, RenterAllocationData,
    RenterBandwidthAllocation, SignedMessage,
};
pub use bucket::{Bucket, PathCipher};
pub use messages::{ErrorKind, PieceRequest, PieceResponse};
pub use node::{NodeAddress, NodeDescriptor, NodeMetadata, NodeRestrictions, NodeStats};
pub use pointer::{meta_flags, Pointer, RedundancyScheme, RemotePiece, RemoteSegment, SegmentData};

use thiserror::Error;

/// Errors raised while validating or decoding protocol structures.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A structure failed its invariant checks.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Canonical decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] orbit_core::DecodeError),

    /// A signature did not verify.
    #[error("signature error: {0}")]
    Signature(#[from] orbit_core::SignatureError),
}
