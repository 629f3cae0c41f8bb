//! Orbit Audit - Stripe sampling and verification.
//!
//! The audit loop walks the pointer space with a persistent cursor, samples
//! a random stripe of a random remote segment, downloads one share from
//! every listed piece, and uses erasure correction to tell mutated shares
//! from honest ones. Outcomes feed the statistics store.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cursor;
pub mod verifier;

pub use cursor::{AuditCursor, Stripe};
pub use verifier::{AuditReport, AuditService, Verifier};

use thiserror::Error;

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The sampled segment cannot be audited.
    #[error("not auditable: {0}")]
    NotAuditable(String),

    /// Too few shares were readable to reach a verdict.
    #[error("audit inconclusive: {0}")]
    Inconclusive(String),

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

    /// Range read failure.
    #[error(transparent)]
    Ranger(#[from] orbit_core::RangerError),

    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
