//! Orbit Core - Core types, traits, and primitives for the Orbit storage network.
//!
//! This crate provides:
//! - Cryptographic primitives (HKDF, AEAD, path encryption, Ed25519)
//! - Canonical encoding for deterministic serialization
//! - Identifier types (NodeId, PieceId, SerialNumber)
//! - Timestamps, stripe padding arithmetic, and the Ranger abstraction

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod encoding;
pub mod identifiers;
pub mod keys;
pub mod pad;
pub mod ranger;
pub mod time;

pub use crypto::*;
pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
pub use identifiers::*;
pub use keys::*;
pub use pad::{pad_amount, padded_size};
pub use ranger::{ByteRanger, Ranger, RangerError};
pub use time::*;

/// Minimum acceptable length of a rendered piece id, in characters.
pub const MIN_PIECE_ID_LENGTH: usize = 20;

/// Maximum keys returned by a single listing page.
pub const LOOKUP_LIMIT: usize = 1000;

/// Hierarchical path delimiter.
pub const PATH_DELIMITER: u8 = b'/';
