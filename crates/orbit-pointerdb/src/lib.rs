//! Orbit PointerDB - The satellite's pointer metadata service.
//!
//! An authenticated, ordered path -> pointer store with hierarchical prefix
//! listing, payer bandwidth allocation issuance, bucket records, and a
//! reclamation log for pieces orphaned by pointer overwrites.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod rpc;
pub mod service;

pub use rpc::{AuthedPointers, PointerRpcServer, Pointers, RemotePointers};
pub use service::{GetResult, ListRequest, PointerDb, PointerDbConfig, PointerItem};

use thiserror::Error;

/// Errors from pointer service operations.
#[derive(Debug, Error)]
pub enum PointerDbError {
    /// Missing or invalid API key.
    #[error("invalid API credential")]
    Unauthenticated,

    /// No pointer at the requested path.
    #[error("pointer not found")]
    NotFound,

    /// Request validation failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store failure.
    #[error(transparent)]
    Kv(#[from] orbit_kv::KvError),

    /// Protocol structure failure.
    #[error(transparent)]
    Proto(#[from] orbit_proto::ProtoError),

    /// Overlay resolution failure.
    #[error(transparent)]
    Overlay(#[from] orbit_overlay::OverlayError),
}
