//! Ed25519 identity keys.
//!
//! Ed25519 is the default identity key type. Besides signing, an Ed25519
//! identity doubles as an ECIES target: the verifying key maps to its
//! X25519 (Montgomery) form via the birational map, and the signing key's
//! X25519 counterpart is the clamped first half of `SHA-512(seed)`, the
//! standard Ed25519-to-Curve25519 conversion.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::StaticSecret;

use crate::{CryptoError, Result};

/// Length of a serialized Ed25519 public key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct Ed25519Keypair {
    signing: SigningKey,
}

impl Ed25519Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Derive a keypair from a 32-byte seed. Deterministic; used by tests
    /// and one-time accounts.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// The serialized public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `msg`, returning the 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }

    /// The X25519 static secret corresponding to this identity.
    pub fn x25519_secret(&self) -> StaticSecret {
        let digest = Sha512::digest(self.signing.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);
        StaticSecret::from(scalar)
    }
}

/// Verify an Ed25519 signature over `msg`.
pub fn verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|e| CryptoError::KeyDecode(format!("ed25519 public key: {e}")))?;
    let sig = Signature::from_slice(sig)
        .map_err(|e| CryptoError::Signature(format!("ed25519 signature: {e}")))?;
    key.verify(msg, &sig)
        .map_err(|e| CryptoError::Signature(format!("ed25519 verify: {e}")))
}

/// The X25519 public key corresponding to an Ed25519 public key.
pub fn x25519_public(public: &[u8; 32]) -> Result<x25519_dalek::PublicKey> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|e| CryptoError::KeyDecode(format!("ed25519 public key: {e}")))?;
    let montgomery = key.to_montgomery();
    Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = Ed25519Keypair::generate();
        let sig = kp.sign(b"payload");
        verify(&kp.public_bytes(), b"payload", &sig).expect("verify");
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let kp = Ed25519Keypair::generate();
        let sig = kp.sign(b"payload");
        assert!(verify(&kp.public_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = Ed25519Keypair::from_seed([9u8; 32]);
        let b = Ed25519Keypair::from_seed([9u8; 32]);
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_x25519_conversion_agrees() {
        // DH over converted keys must agree in both directions.
        let a = Ed25519Keypair::generate();
        let b = Ed25519Keypair::generate();

        let a_sk = a.x25519_secret();
        let b_pk = x25519_public(&b.public_bytes()).expect("convert b");
        let ab = a_sk.diffie_hellman(&b_pk);

        let b_sk = b.x25519_secret();
        let a_pk = x25519_public(&a.public_bytes()).expect("convert a");
        let ba = b_sk.diffie_hellman(&a_pk);

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}
