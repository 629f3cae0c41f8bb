//! Buckets: the top-level namespaces objects live in.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, Timestamp};

/// Cipher applied to path components below a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathCipher {
    /// Paths stored in plaintext.
    None,
    /// Deterministic AES-GCM path encryption.
    #[default]
    AesGcm,
}

impl PathCipher {
    fn tag(&self) -> u32 {
        match self {
            PathCipher::None => 0,
            PathCipher::AesGcm => 1,
        }
    }
}

impl CanonicalEncode for PathCipher {
    fn encode(&self, buf: &mut BytesMut) {
        self.tag().encode(buf);
    }
}

impl CanonicalDecode for PathCipher {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            0 => Ok(PathCipher::None),
            1 => Ok(PathCipher::AesGcm),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// A bucket record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name; must not contain the path delimiter.
    pub name: String,
    /// Path cipher for objects below this bucket.
    pub path_cipher: PathCipher,
    /// Creation time.
    pub created: Timestamp,
}

impl Bucket {
    /// Creates a bucket record with the default path cipher.
    pub fn new(name: impl Into<String>, created: Timestamp) -> Self {
        Self {
            name: name.into(),
            path_cipher: PathCipher::default(),
            created,
        }
    }

    /// Returns true when the name is usable as a single path component.
    pub fn valid_name(name: &str) -> bool {
        !name.is_empty() && !name.contains('/')
    }
}

impl CanonicalEncode for Bucket {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        self.path_cipher.encode(buf);
        self.created.encode(buf);
    }
}

impl CanonicalDecode for Bucket {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            name: String::decode(buf)?,
            path_cipher: PathCipher::decode(buf)?,
            created: Timestamp::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_roundtrip() {
        let bucket = Bucket::new("photos", Timestamp::now());
        let decoded = Bucket::from_bytes(&bucket.to_vec()).unwrap();
        assert_eq!(bucket, decoded);
    }

    #[test]
    fn test_name_validation() {
        assert!(Bucket::valid_name("photos"));
        assert!(!Bucket::valid_name(""));
        assert!(!Bucket::valid_name("a/b"));
    }
}
