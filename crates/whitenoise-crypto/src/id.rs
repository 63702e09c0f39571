//! The self-describing WhiteNoise public identifier.
//!
//! A `WhiteNoiseID` packs a key type tag and the serialized public key into
//! a fixed 34-byte value: `[tag(1)] ‖ public_key_bytes`, zero-padded. It is
//! usable both as a transport identity (its SHA-256 is the peer id) and as
//! an encryption target (via ECIES to the embedded public key).
//!
//! The string form is the tag digit followed by the base58 key bytes, e.g.
//! `0<base58>` for an Ed25519 identity.

use std::fmt;
use std::str::FromStr;

use whitenoise_types::PeerId;

use crate::account::{KeyType, PublicKey};
use crate::hash::{sha256, sha256_b58};
use crate::{ecdsa, ed25519, secp256k1};
use crate::{CryptoError, Result};

/// Fixed length of the packed identifier.
pub const WHITENOISE_ID_LENGTH: usize = 34;

/// Key-type-tagged public identifier of one WhiteNoise participant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WhiteNoiseID([u8; WHITENOISE_ID_LENGTH]);

impl WhiteNoiseID {
    /// Pack a public key into its identifier form.
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut raw = [0u8; WHITENOISE_ID_LENGTH];
        raw[0] = public.key_type() as u8;
        let key = public.key_bytes();
        raw[1..1 + key.len()].copy_from_slice(&key);
        Self(raw)
    }

    /// The raw 34-byte form.
    pub fn as_bytes(&self) -> &[u8; WHITENOISE_ID_LENGTH] {
        &self.0
    }

    /// The key type recorded in the tag byte.
    pub fn key_type(&self) -> Result<KeyType> {
        KeyType::from_tag(self.0[0])
    }

    /// Decode the embedded public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        let key_type = self.key_type()?;
        let key = &self.0[1..1 + key_type.public_key_length()];
        match key_type {
            KeyType::Ed25519 => {
                let bytes: [u8; 32] = key
                    .try_into()
                    .map_err(|_| CryptoError::InvalidId("truncated ed25519 key".into()))?;
                // Validate the point decodes.
                ed25519::x25519_public(&bytes)?;
                Ok(PublicKey::Ed25519(bytes))
            }
            KeyType::Secp256k1 => Ok(PublicKey::Secp256k1(secp256k1::decode_public(key)?)),
            KeyType::Ecdsa => Ok(PublicKey::Ecdsa(ecdsa::decode_public(key)?)),
        }
    }

    /// Base58 SHA-256 of the identifier; the destination mask used in
    /// gossip and proxy registration.
    pub fn hash(&self) -> String {
        sha256_b58(&self.0)
    }

    /// The transport peer id: SHA-256 of the identifier bytes.
    pub fn peer_id(&self) -> PeerId {
        PeerId(sha256(&self.0))
    }

    /// ECIES-encrypt `plaintext` to this identity.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public_key()?.encrypt(plaintext)
    }
}

impl fmt::Display for WhiteNoiseID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key_len = match self.key_type() {
            Ok(kt) => kt.public_key_length(),
            // An unparseable tag still renders, with the full padded body.
            Err(_) => WHITENOISE_ID_LENGTH - 1,
        };
        let key = &self.0[1..1 + key_len];
        write!(f, "{}{}", self.0[0], bs58::encode(key).into_string())
    }
}

impl fmt::Debug for WhiteNoiseID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WhiteNoiseID({self})")
    }
}

impl FromStr for WhiteNoiseID {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let tag_char = chars
            .next()
            .ok_or_else(|| CryptoError::InvalidId("empty identity string".into()))?;
        let tag = tag_char
            .to_digit(10)
            .ok_or_else(|| CryptoError::InvalidId(format!("bad key type digit {tag_char}")))?
            as u8;
        let key_type = KeyType::from_tag(tag)?;

        let key = bs58::decode(chars.as_str())
            .into_vec()
            .map_err(|e| CryptoError::InvalidId(format!("base58 decode: {e}")))?;
        if key.len() != key_type.public_key_length() {
            return Err(CryptoError::InvalidId(format!(
                "key length {} does not match key type {:?}",
                key.len(),
                key_type
            )));
        }

        let mut raw = [0u8; WHITENOISE_ID_LENGTH];
        raw[0] = tag;
        raw[1..1 + key.len()].copy_from_slice(&key);
        Ok(Self(raw))
    }
}
