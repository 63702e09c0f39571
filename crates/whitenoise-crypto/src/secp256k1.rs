//! Secp256k1 identity keys.
//!
//! Supported for wallets and tooling that already hold secp256k1 material.
//! Public keys are carried in compressed SEC1 form (33 bytes); signatures
//! are fixed-width 64-byte ECDSA.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::{CryptoError, Result};

/// Length of a compressed SEC1 secp256k1 public key.
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// A secp256k1 keypair.
#[derive(Clone)]
pub struct Secp256k1Keypair {
    secret: SecretKey,
}

impl Secp256k1Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Derive a keypair from 32 seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Result<Self> {
        let secret = SecretKey::from_slice(&seed)
            .map_err(|e| CryptoError::KeyDecode(format!("secp256k1 secret: {e}")))?;
        Ok(Self { secret })
    }

    /// Compressed SEC1 public key bytes.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// The secret key, for ECDH.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Sign `msg`, returning a fixed 64-byte ECDSA signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signing = SigningKey::from(&self.secret);
        let sig: Signature = signing.sign(msg);
        sig.to_bytes().to_vec()
    }
}

/// Decode a compressed SEC1 public key.
pub fn decode_public(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|e| CryptoError::KeyDecode(format!("secp256k1 public key: {e}")))
}

/// Verify a 64-byte ECDSA signature over `msg`.
pub fn verify(public: &PublicKey, msg: &[u8], sig: &[u8]) -> Result<()> {
    let sig = Signature::from_slice(sig)
        .map_err(|e| CryptoError::Signature(format!("secp256k1 signature: {e}")))?;
    VerifyingKey::from(public)
        .verify(msg, &sig)
        .map_err(|e| CryptoError::Signature(format!("secp256k1 verify: {e}")))
}
