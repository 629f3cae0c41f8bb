//! HKDF-SHA-256 key derivation per RFC 5869.
//!
//! Used for:
//! - path component key chaining
//! - per-segment data keys and first nonces

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA-256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any size");
    mac.update(message);
    let result = mac.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result.into_bytes());
    output
}

/// HKDF-SHA-256 extract-and-expand.
///
/// # Arguments
/// * `ikm` - input keying material
/// * `salt` - optional salt (empty salt is treated as 32 zero bytes)
/// * `info` - context string
/// * `length` - output length, 1..=8160 bytes
///
/// # Panics
/// Panics if `length` is 0 or exceeds 8160 (255 * 32) bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let n = length.div_ceil(32);
    assert!((1..=255).contains(&n), "HKDF output length must be 1-8160 bytes");

    let prk = if salt.is_empty() {
        hmac_sha256(&[0u8; 32], ikm)
    } else {
        hmac_sha256(salt, ikm)
    };

    let mut output = Vec::with_capacity(length);
    let mut t = Vec::new();

    for i in 1..=n {
        let mut message = t.clone();
        message.extend_from_slice(info);
        message.push(i as u8);
        t = hmac_sha256(&prk, &message).to_vec();
        output.extend_from_slice(&t);
    }

    output.truncate(length);
    output
}

/// Derives a fixed 32-byte key.
pub fn hkdf_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let okm = hkdf_sha256(ikm, salt, info, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 5869 Test Case 1.
    #[test]
    fn test_rfc5869_case1() {
        let ikm = vec![0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf_sha256(&ikm, &salt, &info, 42);

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();

        assert_eq!(okm, expected);
    }

    /// RFC 5869 Test Case 3 (zero-length salt and info).
    #[test]
    fn test_rfc5869_case3() {
        let ikm = vec![0x0bu8; 22];

        let okm = hkdf_sha256(&ikm, &[], &[], 42);

        let expected = hex::decode(
            "8da4e775a563c18f715f802a063c5a31b8a11f5c5ee1879ec3454e5f3c738d2d9d201395faa4b61a96c8",
        )
        .unwrap();

        assert_eq!(okm, expected);
    }

    #[test]
    fn test_distinct_infos_give_distinct_keys() {
        let ikm = [0x42u8; 32];
        let a = hkdf_key(&ikm, &[], b"orbit/segment-key");
        let b = hkdf_key(&ikm, &[], b"orbit/segment-nonce");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let ikm = [0x42u8; 32];
        let salt = [0x17u8; 8];
        assert_eq!(
            hkdf_sha256(&ikm, &salt, b"ctx", 64),
            hkdf_sha256(&ikm, &salt, b"ctx", 64)
        );
    }
}
