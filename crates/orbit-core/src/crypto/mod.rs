//! Cryptographic primitives for Orbit.
//!
//! - HKDF-SHA-256 (RFC 5869) for all key derivation
//! - AES-256-GCM for segment data blocks
//! - AES-256-GCM-SIV for deterministic path component encryption
//! - Ed25519 for bandwidth allocation signatures

mod aead;
mod hkdf;
mod path;
mod signature;

pub use aead::{decrypt_aes_gcm, encrypt_aes_gcm, AeadError};
pub use hkdf::{hkdf_sha256, hmac_sha256};
pub use path::{decrypt_path, derive_path_key, derive_segment_key, encrypt_path, PathCipherError};
pub use signature::{sign, verify, Keypair, SignatureError};

/// AEAD nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// AEAD tag size.
pub const TAG_SIZE: usize = 16;

/// Key size for all symmetric operations.
pub const KEY_SIZE: usize = 32;

/// Signature size for Ed25519.
pub const SIGNATURE_SIZE: usize = 64;

/// Builds the nonce for data block `counter` within a segment.
///
/// The 96-bit nonce is the segment's first nonce XORed with the
/// little-endian block counter, so block nonces never repeat within a
/// segment while random access stays cheap.
pub fn block_nonce(first_nonce: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *first_nonce;
    for (i, byte) in counter.to_le_bytes().iter().enumerate() {
        nonce[i] ^= byte;
    }
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_nonce_zero_counter_is_identity() {
        let first = [0x42u8; NONCE_SIZE];
        assert_eq!(block_nonce(&first, 0), first);
    }

    #[test]
    fn test_block_nonces_are_distinct() {
        let first = [0x42u8; NONCE_SIZE];
        let mut seen = std::collections::HashSet::new();
        for counter in 0..1000 {
            assert!(seen.insert(block_nonce(&first, counter)));
        }
    }

    #[test]
    fn test_block_nonce_xors_low_bytes() {
        let first = [0u8; NONCE_SIZE];
        let nonce = block_nonce(&first, 0x0102);
        assert_eq!(nonce[0], 0x02);
        assert_eq!(nonce[1], 0x01);
        assert_eq!(&nonce[2..], &[0u8; 10]);
    }
}
