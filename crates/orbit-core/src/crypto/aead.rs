//! AES-256-GCM authenticated encryption.
//!
//! Segment data is encrypted client-side in fixed-size blocks; each block
//! carries its 16-byte tag so storage nodes only ever see ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use super::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Errors that can occur during AEAD operations.
#[derive(Debug, Error)]
pub enum AeadError {
    /// Invalid key length (must be 32 bytes)
    #[error("invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid nonce length (must be 12 bytes)
    #[error("invalid nonce length: expected {NONCE_SIZE} bytes, got {0}")]
    InvalidNonceLength(usize),

    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Ciphertext too short (must contain at least the tag)
    #[error("ciphertext too short: expected at least {TAG_SIZE} bytes, got {0}")]
    CiphertextTooShort(usize),
}

/// Encrypts plaintext with AES-256-GCM.
///
/// Returns ciphertext concatenated with the 16-byte authentication tag.
/// The nonce is not included in the output; block nonces are derived from
/// the segment's first nonce and the block counter.
pub fn encrypt_aes_gcm(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if key.len() != KEY_SIZE {
        return Err(AeadError::InvalidKeyLength(key.len()));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(AeadError::InvalidNonceLength(nonce.len()));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength(key.len()))?;

    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| AeadError::EncryptionFailed)
}

/// Decrypts AES-256-GCM ciphertext produced by [`encrypt_aes_gcm`].
pub fn decrypt_aes_gcm(
    key: &[u8],
    nonce: &[u8],
    ciphertext_with_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if key.len() != KEY_SIZE {
        return Err(AeadError::InvalidKeyLength(key.len()));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(AeadError::InvalidNonceLength(nonce.len()));
    }
    if ciphertext_with_tag.len() < TAG_SIZE {
        return Err(AeadError::CiphertextTooShort(ciphertext_with_tag.len()));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength(key.len()))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext_with_tag,
                aad,
            },
        )
        .map_err(|_| AeadError::DecryptionFailed)
}
