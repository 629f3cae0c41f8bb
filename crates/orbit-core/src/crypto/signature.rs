//! Ed25519 signatures for bandwidth allocations.
//!
//! The satellite signs payer allocations; uplinks countersign per-segment
//! totals. Storage nodes verify both before moving bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use super::SIGNATURE_SIZE;

/// Errors from signing and verification.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Public key bytes were not a valid Ed25519 point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature bytes had the wrong length.
    #[error("invalid signature length: expected {SIGNATURE_SIZE}, got {0}")]
    InvalidSignatureLength(usize),

    /// Verification failed.
    #[error("signature verification failed")]
    VerificationFailed,
}

/// An Ed25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        use rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a keypair from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Returns the 32-byte seed.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair(pub={})", hex::encode(&self.public_key()[..8]))
    }
}

/// Signs `message` with `keypair`, returning the 64-byte signature.
pub fn sign(keypair: &Keypair, message: &[u8]) -> Vec<u8> {
    keypair.sign(message)
}

/// Verifies `signature` over `message` against `public_key`.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureLength(signature.len()))?;
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = Keypair::generate();
        let message = b"allocation data";
        let signature = sign(&keypair, message);
        verify(&keypair.public_key(), message, &signature).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keypair = Keypair::generate();
        let signature = sign(&keypair, b"original");
        let result = verify(&keypair.public_key(), b"tampered", &signature);
        assert!(matches!(result, Err(SignatureError::VerificationFailed)));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let signature = sign(&keypair, b"message");
        let result = verify(&other.public_key(), b"message", &signature);
        assert!(matches!(result, Err(SignatureError::VerificationFailed)));
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let keypair = Keypair::generate();
        let result = verify(&keypair.public_key(), b"message", &[0u8; 10]);
        assert!(matches!(result, Err(SignatureError::InvalidSignatureLength(10))));
    }

    #[test]
    fn test_seed_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_seed(&keypair.seed());
        assert_eq!(keypair.public_key(), restored.public_key());
    }
}
