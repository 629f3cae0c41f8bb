//! Orbit Piecestore - The storage-node side of the network.
//!
//! Serves Store/Retrieve/Delete/Stat piece sessions against a
//! content-addressed on-disk directory, enforces per-node space and
//! bandwidth budgets, persists signed bandwidth allocations, and settles
//! them back to satellites.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod agreements;
pub mod client;
pub mod psdb;
pub mod pstore;
pub mod server;
pub mod throttle;

pub use agreements::{AgreementReceiver, AgreementSender, SatelliteResolver};
pub use client::{PieceRanger, PieceStoreClient};
pub use psdb::{PieceDb, TtlEntry};
pub use pstore::PieceStorage;
pub use server::{PieceStoreServer, ServerConfig, SpaceReport};
pub use throttle::{Throttle, ThrottleError};

use thiserror::Error;

use orbit_proto::ErrorKind;

/// Chunk size used when streaming piece content.
pub const MESSAGE_SIZE: usize = 32 * 1024;

/// Errors from piece-store operations.
#[derive(Debug, Error)]
pub enum PieceStoreError {
    /// Missing or invalid authorization.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The piece does not exist.
    #[error("piece not found")]
    NotFound,

    /// Request validation failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The node's committed space is exhausted.
    #[error("out of space")]
    OutOfSpace,

    /// The node's committed bandwidth is exhausted.
    #[error("out of bandwidth")]
    OutOfBandwidth,

    /// Signature or allocation consistency failure.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// The peer closed the session before the operation finished.
    #[error("unexpected end of session")]
    UnexpectedEof,

    /// The operation was canceled.
    #[error("canceled")]
    Canceled,

    /// The remote returned a wire error.
    #[error("remote error ({kind:?}): {message}")]
    Remote {
        /// Remote classification.
        kind: ErrorKind,
        /// Remote details.
        message: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Net(#[from] orbit_net::NetError),

    /// Database failure.
    #[error(transparent)]
    Kv(#[from] orbit_kv::KvError),

    /// Protocol structure failure.
    #[error(transparent)]
    Proto(#[from] orbit_proto::ProtoError),

    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PieceStoreError {
    /// Maps this error to its wire classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PieceStoreError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            PieceStoreError::NotFound => ErrorKind::NotFound,
            PieceStoreError::Validation(_) => ErrorKind::Validation,
            PieceStoreError::OutOfSpace => ErrorKind::OutOfSpace,
            PieceStoreError::OutOfBandwidth => ErrorKind::OutOfBandwidth,
            PieceStoreError::Integrity(_) | PieceStoreError::Proto(_) => ErrorKind::Integrity,
            PieceStoreError::Canceled => ErrorKind::Canceled,
            _ => ErrorKind::Internal,
        }
    }
}
