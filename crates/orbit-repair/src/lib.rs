//! Orbit Repair - Keeping segments above their repair threshold.
//!
//! The checker periodically scans pointers, counts healthy pieces through
//! the overlay, and enqueues segments that fell below their repair
//! threshold. The worker drains the queue and reconstructs missing pieces
//! onto fresh nodes.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod checker;
pub mod queue;
pub mod worker;

pub use checker::Checker;
pub use queue::{InjuredSegment, RepairQueue};
pub use worker::RepairWorker;

use thiserror::Error;

/// Errors from repair operations.
#[derive(Debug, Error)]
pub enum RepairError {
    /// Queue entry could not be decoded.
    #[error("corrupt queue entry: {0}")]
    CorruptEntry(String),

    /// Store failure.
    #[error(transparent)]
    Kv(#[from] orbit_kv::KvError),

    /// Pointer service failure.
    #[error(transparent)]
    PointerDb(#[from] orbit_pointerdb::PointerDbError),

    /// Overlay failure.
    #[error(transparent)]
    Overlay(#[from] orbit_overlay::OverlayError),

    /// Pipeline failure during reconstruction.
    #[error(transparent)]
    Pipeline(#[from] orbit_pipeline::PipelineError),
}
