//! Secret key types.
//!
//! The root encryption key never leaves the uplink; the API key authenticates
//! uplinks to the pointer service. Both zeroize on drop.

use std::fmt;

use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// Root symmetric key for a bucket's content and path encryption.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKey(pub [u8; 32]);

impl RootKey {
    /// Creates a root key from bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random root key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derives a root key from a passphrase by hashing it.
    pub fn from_passphrase(phrase: &str) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(phrase.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootKey([REDACTED])")
    }
}

impl Drop for RootKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl CanonicalEncode for RootKey {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl CanonicalDecode for RootKey {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; 32]>::decode(buf)?))
    }
}

/// API key authenticating an uplink to the satellite's services.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey(Vec<u8>);

impl ApiKey {
    /// Creates an API key from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generates a random 32-byte API key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses the URL-safe base64 rendering.
    pub fn from_base64(s: &str) -> Option<Self> {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .ok()
            .map(Self)
    }

    /// Returns the URL-safe base64 rendering.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Returns the raw key bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Constant-time comparison against another key.
    pub fn matches(&self, other: &ApiKey) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
