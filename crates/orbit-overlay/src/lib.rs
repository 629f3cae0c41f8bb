//! Orbit Overlay - Node directory and reputation.
//!
//! The overlay cache is the satellite's authoritative view of storage
//! nodes, fed by DHT discovery and updated by audits. Node selection for
//! uploads and repair draws from it; the statistics store decides which
//! nodes remain eligible.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod discovery;
pub mod statdb;

pub use cache::{ChooseOptions, NodeSelector, OverlayCache};
pub use discovery::{Discovery, NodeSource};
pub use statdb::{StatDb, UpdateRequest};

use thiserror::Error;

/// Errors from overlay operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// No descriptor for the requested node.
    #[error("node not found")]
    NodeNotFound,

    /// A zero node id was supplied.
    #[error("empty node id")]
    EmptyNode,

    /// The requested entry already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// Selection could not satisfy the requested amount.
    #[error("not enough nodes: requested {requested}, found {found}")]
    NotEnoughNodes {
        /// Nodes requested.
        requested: usize,
        /// Eligible nodes found.
        found: usize,
    },

    /// A stored record failed to decode.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Store failure.
    #[error(transparent)]
    Kv(#[from] orbit_kv::KvError),

    /// Discovery source failure.
    #[error("discovery failed: {0}")]
    Discovery(String),
}
