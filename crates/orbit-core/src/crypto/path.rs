//! Hierarchical path encryption.
//!
//! Object paths are encrypted component by component so the pointer service
//! can still list by prefix without learning names. Each component is
//! encrypted under a key chained from the bucket root key through the
//! preceding plaintext components, with AES-256-GCM-SIV and a nonce derived
//! deterministically from the component. Encrypting the same component under
//! the same parent therefore yields the same ciphertext, which keeps shared
//! prefixes byte-identical and lexicographic listing stable.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256GcmSiv, Nonce,
};
use base64::Engine as _;
use thiserror::Error;

use super::hkdf::{hkdf_key, hmac_sha256};
use super::NONCE_SIZE;
use crate::keys::RootKey;

const PATH_KEY_INFO: &[u8] = b"orbit/path-key";
const SEGMENT_KEY_INFO: &[u8] = b"orbit/segment-key";
const SEGMENT_NONCE_INFO: &[u8] = b"orbit/segment-nonce";

/// Errors from path encryption and decryption.
#[derive(Debug, Error)]
pub enum PathCipherError {
    /// Component could not be decoded (bad base64 or truncated).
    #[error("malformed encrypted component: {0}")]
    MalformedComponent(String),

    /// Authentication failed while decrypting a component.
    #[error("component decryption failed")]
    DecryptionFailed,

    /// Component encryption failed.
    #[error("component encryption failed")]
    EncryptionFailed,

    /// Derivation depth exceeds the number of path components.
    #[error("depth {depth} greater than path length {len}")]
    DepthOutOfRange {
        /// Requested depth.
        depth: usize,
        /// Number of components in the path.
        len: usize,
    },

    /// Decrypted component bytes were not valid UTF-8.
    #[error("decrypted component is not valid UTF-8")]
    InvalidUtf8,
}

fn base64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
}

fn next_key(key: &[u8; 32], component: &str) -> [u8; 32] {
    hkdf_key(key, component.as_bytes(), PATH_KEY_INFO)
}

fn encrypt_component(key: &[u8; 32], component: &str) -> Result<String, PathCipherError> {
    let mac = hmac_sha256(key, component.as_bytes());
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&mac[..NONCE_SIZE]);

    let cipher = Aes256GcmSiv::new_from_slice(key).map_err(|_| PathCipherError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: component.as_bytes(),
                aad: &[],
            },
        )
        .map_err(|_| PathCipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(base64().encode(out))
}

fn decrypt_component(key: &[u8; 32], component: &str) -> Result<String, PathCipherError> {
    let raw = base64()
        .decode(component)
        .map_err(|e| PathCipherError::MalformedComponent(e.to_string()))?;
    if raw.len() < NONCE_SIZE {
        return Err(PathCipherError::MalformedComponent(format!(
            "component too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
    let cipher = Aes256GcmSiv::new_from_slice(key).map_err(|_| PathCipherError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| PathCipherError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| PathCipherError::InvalidUtf8)
}

/// Encrypts a `/`-delimited path under the bucket root key.
pub fn encrypt_path(path: &str, key: &RootKey) -> Result<String, PathCipherError> {
    let mut current = *key.as_bytes();
    let mut encrypted = Vec::new();
    for component in path.split('/') {
        encrypted.push(encrypt_component(&current, component)?);
        current = next_key(&current, component);
    }
    Ok(encrypted.join("/"))
}

/// Decrypts a path produced by [`encrypt_path`].
pub fn decrypt_path(path: &str, key: &RootKey) -> Result<String, PathCipherError> {
    let mut current = *key.as_bytes();
    let mut decrypted = Vec::new();
    for component in path.split('/') {
        let plain = decrypt_component(&current, component)?;
        current = next_key(&current, &plain);
        decrypted.push(plain);
    }
    Ok(decrypted.join("/"))
}

/// Derives the key a holder needs to work below `depth` components of `path`.
///
/// Sharing the derived key grants access to the subtree without revealing
/// names above it.
pub fn derive_path_key(
    path: &str,
    key: &RootKey,
    depth: usize,
) -> Result<RootKey, PathCipherError> {
    let components: Vec<&str> = path.split('/').collect();
    if depth > components.len() {
        return Err(PathCipherError::DepthOutOfRange {
            depth,
            len: components.len(),
        });
    }

    let mut current = *key.as_bytes();
    for component in &components[..depth] {
        current = next_key(&current, component);
    }
    Ok(RootKey::new(current))
}

/// Derives the content key and first block nonce for a segment of `path`.
pub fn derive_segment_key(
    path: &str,
    key: &RootKey,
    segment_index: u64,
) -> Result<([u8; 32], [u8; NONCE_SIZE]), PathCipherError> {
    let components: Vec<&str> = path.split('/').collect();
    let leaf = derive_path_key(path, key, components.len())?;

    let salt = segment_index.to_le_bytes();
    let data_key = hkdf_key(leaf.as_bytes(), &salt, SEGMENT_KEY_INFO);
    let nonce_material = hkdf_key(leaf.as_bytes(), &salt, SEGMENT_NONCE_INFO);

    let mut first_nonce = [0u8; NONCE_SIZE];
    first_nonce.copy_from_slice(&nonce_material[..NONCE_SIZE]);
    Ok((data_key, first_nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(components: &[&str]) -> String {
        components.join("/")
    }

    #[test]
    fn test_path_roundtrip() {
        for path in [
            "",
            "/",
            "//",
            "file.txt",
            "file.txt/",
            "fold1/file.txt",
            "fold1/fold2/file.txt",
            "/fold1/fold2/fold3/file.txt",
        ] {
            let key = RootKey::random();
            let encrypted = encrypt_path(path, &key).unwrap();
            let decrypted = decrypt_path(&encrypted, &key).unwrap();
            assert_eq!(path, decrypted, "path {path:?}");
        }
    }

    #[test]
    fn test_prefix_determinism() {
        let key = RootKey::random();
        let a = encrypt_path("docs/2024/report.pdf", &key).unwrap();
        let b = encrypt_path("docs/2024/summary.pdf", &key).unwrap();
        let c = encrypt_path("docs/2023/report.pdf", &key).unwrap();

        let a_parts: Vec<&str> = a.split('/').collect();
        let b_parts: Vec<&str> = b.split('/').collect();
        let c_parts: Vec<&str> = c.split('/').collect();

        assert_eq!(a_parts[0], b_parts[0]);
        assert_eq!(a_parts[1], b_parts[1]);
        assert_ne!(a_parts[2], b_parts[2]);

        assert_eq!(a_parts[0], c_parts[0]);
        assert_ne!(a_parts[1], c_parts[1]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt_path("secret/file", &RootKey::random()).unwrap();
        assert!(decrypt_path(&encrypted, &RootKey::random()).is_err());
    }

    #[test]
    fn test_derive_path_key_shares_subtree() {
        let path = "fold1/fold2/fold3/file.txt";
        let key = RootKey::random();
        let encrypted = encrypt_path(path, &key).unwrap();

        for depth in 0..=4 {
            let derived = derive_path_key(path, &key, depth).unwrap();
            let shared = join(&encrypted.split('/').collect::<Vec<_>>()[depth..]);
            let decrypted = decrypt_path(&shared, &derived).unwrap();
            let expected = join(&path.split('/').collect::<Vec<_>>()[depth..]);
            assert_eq!(decrypted, expected, "depth {depth}");
        }
    }

    #[test]
    fn test_derive_path_key_depth_out_of_range() {
        let key = RootKey::random();
        let err = derive_path_key("a/b", &key, 3).unwrap_err();
        assert!(matches!(err, PathCipherError::DepthOutOfRange { depth: 3, len: 2 }));
    }

    #[test]
    fn test_segment_keys_differ_by_index() {
        let key = RootKey::random();
        let (k0, n0) = derive_segment_key("bucket/obj", &key, 0).unwrap();
        let (k1, n1) = derive_segment_key("bucket/obj", &key, 1).unwrap();
        assert_ne!(k0, k1);
        assert_ne!(n0, n1);

        let (k0_again, n0_again) = derive_segment_key("bucket/obj", &key, 0).unwrap();
        assert_eq!(k0, k0_again);
        assert_eq!(n0, n0_again);
    }
}
