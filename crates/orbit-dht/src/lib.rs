//! Orbit DHT - Kademlia node discovery.
//!
//! Storage nodes and satellites share a 256-bit id space. The routing table
//! organizes peers into k-buckets by XOR distance with per-bucket
//! replacement caches; lookups walk the network with alpha parallel
//! workers over a shared distance-ordered queue.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod lookup;
pub mod routing;
pub mod service;

pub use lookup::{find_node, LookupConfig, NodeQuery};
pub use routing::{KBucket, RoutingNode, RoutingTable, RoutingTableConfig};
pub use service::{DhtConfig, DhtService, NodeMessage};

use thiserror::Error;

/// Default bucket size (k).
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default replacement cache capacity per bucket.
pub const DEFAULT_CACHE_SIZE: usize = 5;

/// Default lookup parallelism (alpha).
pub const DEFAULT_ALPHA: usize = 3;

/// Errors from DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// A peer could not be queried.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The lookup was canceled.
    #[error("lookup canceled")]
    Canceled,

    /// Transport failure.
    #[error(transparent)]
    Net(#[from] orbit_net::NetError),

    /// Undecodable peer message.
    #[error("bad message: {0}")]
    BadMessage(String),
}
