//! Orbit Pipeline - The object read/write path.
//!
//! Uploads stream through segmentation, client-side encryption, and erasure
//! dispersal onto storage nodes; downloads reverse the path with lazy piece
//! readers and first-k fan-in. Repair reconstructs missing pieces onto
//! fresh nodes.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod decode;
pub mod ec;
pub mod encode;
pub mod encryption;
pub mod multipart;
pub mod object;
pub mod peek;
pub mod segments;

pub use decode::DecodedRanger;
pub use ec::EcClient;
pub use encode::encode_shares;
pub use encryption::{encrypt_stream, ciphertext_size, DecryptedRanger};
pub use multipart::{multipart_stream, MultipartError, MultipartWriter};
pub use object::{ObjectMeta, ObjectStore};
pub use peek::PeekThresholdReader;
pub use segments::{SegmentMeta, SegmentStore, SegmentStoreConfig};

use thiserror::Error;

/// Errors from pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fewer puts succeeded than the repair threshold requires.
    #[error("successful puts ({got}) fewer than repair threshold ({needed})")]
    NotEnoughSuccesses {
        /// Puts that succeeded.
        got: usize,
        /// Repair threshold.
        needed: usize,
    },

    /// Too few healthy pieces remain to reconstruct the segment.
    #[error("unrecoverable: {healthy} healthy pieces, {required} required")]
    Unrecoverable {
        /// Healthy pieces found.
        healthy: usize,
        /// Required count (k).
        required: usize,
    },

    /// The operation was canceled; partial work has been rolled back.
    #[error("canceled")]
    Canceled,

    /// Request or state validation failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Pointer service failure.
    #[error(transparent)]
    PointerDb(#[from] orbit_pointerdb::PointerDbError),

    /// Piece store failure.
    #[error(transparent)]
    PieceStore(#[from] orbit_piecestore::PieceStoreError),

    /// Erasure coding failure.
    #[error(transparent)]
    Erasure(#[from] orbit_erasure::ErasureError),

    /// Overlay failure.
    #[error(transparent)]
    Overlay(#[from] orbit_overlay::OverlayError),

    /// Encryption failure.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Range read failure.
    #[error(transparent)]
    Ranger(#[from] orbit_core::RangerError),

    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<orbit_core::crypto::PathCipherError> for PipelineError {
    fn from(err: orbit_core::crypto::PathCipherError) -> Self {
        PipelineError::Encryption(err.to_string())
    }
}

impl From<orbit_core::crypto::AeadError> for PipelineError {
    fn from(err: orbit_core::crypto::AeadError) -> Self {
        PipelineError::Encryption(err.to_string())
    }
}
