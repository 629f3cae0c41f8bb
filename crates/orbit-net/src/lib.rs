//! Orbit Net - Session transport for piece and control traffic.
//!
//! A session is a bidirectional stream of length-prefixed frames carrying
//! canonically encoded messages. Two transports are provided: an in-memory
//! registry transport for tests and single-process assemblies, and a TCP
//! transport for real deployments.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod demux;
pub mod pool;
pub mod transport;

pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use demux::{Demux, TaggedTransport};
pub use pool::{ConnectionPool, SharedChannel};
pub use transport::{LocalTransport, TcpTransport, Transport, DIAL_TIMEOUT};

use thiserror::Error;

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer could not be reached.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The dial exceeded the dial timeout.
    #[error("dial timed out")]
    DialTimeout,

    /// The session is closed.
    #[error("session closed")]
    Closed,

    /// A frame exceeded the size limit or failed to decode.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<orbit_core::DecodeError> for NetError {
    fn from(err: orbit_core::DecodeError) -> Self {
        NetError::BadFrame(err.to_string())
    }
}
