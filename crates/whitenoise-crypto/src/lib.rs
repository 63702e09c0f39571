//! # whitenoise-crypto
//!
//! Cryptographic identities for the WhiteNoise overlay:
//!
//! - [`account`] - key-type-tagged identity keypairs (Ed25519, Secp256k1,
//!   ECDSA P-256) and the [`Account`] wrapper held by a node
//! - [`id`] - the self-describing [`WhiteNoiseID`] public identifier
//! - [`ecies`] - ECIES encryption to a `WhiteNoiseID`, used for the gossiped
//!   circuit negotiation payload
//! - [`hash`] - SHA-256 helpers and the base58 digest form used for message
//!   ids and destination masking

pub mod account;
pub mod ecdsa;
pub mod ecies;
pub mod ed25519;
pub mod hash;
pub mod id;
pub mod secp256k1;

pub use account::{Account, KeyType, Keypair, PublicKey};
pub use id::WhiteNoiseID;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A public or private key could not be decoded.
    #[error("key decode error: {0}")]
    KeyDecode(String),

    /// Signing failed or a signature did not verify.
    #[error("signature error: {0}")]
    Signature(String),

    /// ECIES encryption or decryption failed.
    #[error("ecies error: {0}")]
    Ecies(String),

    /// The key type tag is not one of the supported values.
    #[error("unsupported key type {0}")]
    UnsupportedKeyType(u8),

    /// A WhiteNoiseID was malformed.
    #[error("invalid identity: {0}")]
    InvalidId(String),
}

/// Convenience result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
