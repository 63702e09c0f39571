//! Key-type-tagged identity keypairs.
//!
//! Every node holds one long-term [`Account`]. The account's keypair signs
//! handshake payloads and decrypts ECIES material addressed to its
//! [`WhiteNoiseID`](crate::WhiteNoiseID). Three key types are supported,
//! identified on the wire by a one-byte tag.

use whitenoise_types::PeerId;

use crate::ecdsa::EcdsaKeypair;
use crate::ed25519::Ed25519Keypair;
use crate::secp256k1::Secp256k1Keypair;
use crate::{ecdsa, ecies, ed25519, secp256k1};
use crate::{CryptoError, Result, WhiteNoiseID};

/// Identity key algorithm, as carried in the id's leading tag byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Ed25519 = 0,
    Secp256k1 = 1,
    Ecdsa = 2,
}

impl KeyType {
    /// Decode a tag byte.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(KeyType::Ed25519),
            1 => Ok(KeyType::Secp256k1),
            2 => Ok(KeyType::Ecdsa),
            other => Err(CryptoError::UnsupportedKeyType(other)),
        }
    }

    /// Serialized public key length for this key type.
    pub fn public_key_length(&self) -> usize {
        match self {
            KeyType::Ed25519 => ed25519::PUBLIC_KEY_LENGTH,
            KeyType::Secp256k1 => secp256k1::PUBLIC_KEY_LENGTH,
            KeyType::Ecdsa => ecdsa::PUBLIC_KEY_LENGTH,
        }
    }
}

/// Default key type for newly generated accounts.
pub const DEFAULT_KEY_TYPE: KeyType = KeyType::Ed25519;

/// An identity keypair of any supported type.
#[derive(Clone)]
pub enum Keypair {
    Ed25519(Ed25519Keypair),
    Secp256k1(Secp256k1Keypair),
    Ecdsa(EcdsaKeypair),
}

impl Keypair {
    /// Generate a fresh keypair of the given type.
    pub fn generate(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Ed25519 => Keypair::Ed25519(Ed25519Keypair::generate()),
            KeyType::Secp256k1 => Keypair::Secp256k1(Secp256k1Keypair::generate()),
            KeyType::Ecdsa => Keypair::Ecdsa(EcdsaKeypair::generate()),
        }
    }

    /// Derive a keypair from 32 seed bytes. Deterministic.
    pub fn from_seed(key_type: KeyType, seed: [u8; 32]) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => Ok(Keypair::Ed25519(Ed25519Keypair::from_seed(seed))),
            KeyType::Secp256k1 => Ok(Keypair::Secp256k1(Secp256k1Keypair::from_seed(seed)?)),
            KeyType::Ecdsa => Ok(Keypair::Ecdsa(EcdsaKeypair::from_seed(seed)?)),
        }
    }

    /// The key type tag.
    pub fn key_type(&self) -> KeyType {
        match self {
            Keypair::Ed25519(_) => KeyType::Ed25519,
            Keypair::Secp256k1(_) => KeyType::Secp256k1,
            Keypair::Ecdsa(_) => KeyType::Ecdsa,
        }
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        match self {
            Keypair::Ed25519(kp) => PublicKey::Ed25519(kp.public_bytes()),
            Keypair::Secp256k1(kp) => {
                // A freshly serialized compressed point always decodes.
                match secp256k1::decode_public(&kp.public_bytes()) {
                    Ok(pk) => PublicKey::Secp256k1(pk),
                    Err(_) => unreachable!("own public key must decode"),
                }
            }
            Keypair::Ecdsa(kp) => match ecdsa::decode_public(&kp.public_bytes()) {
                Ok(pk) => PublicKey::Ecdsa(pk),
                Err(_) => unreachable!("own public key must decode"),
            },
        }
    }

    /// Sign `msg` with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        match self {
            Keypair::Ed25519(kp) => kp.sign(msg),
            Keypair::Secp256k1(kp) => kp.sign(msg),
            Keypair::Ecdsa(kp) => kp.sign(msg),
        }
    }
}

/// A decoded identity public key of any supported type.
#[derive(Clone)]
pub enum PublicKey {
    Ed25519([u8; 32]),
    Secp256k1(k256::PublicKey),
    Ecdsa(p256::PublicKey),
}

impl PublicKey {
    /// The key type tag.
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Ed25519(_) => KeyType::Ed25519,
            PublicKey::Secp256k1(_) => KeyType::Secp256k1,
            PublicKey::Ecdsa(_) => KeyType::Ecdsa,
        }
    }

    /// Serialized public key bytes (tag not included).
    pub fn key_bytes(&self) -> Vec<u8> {
        use k256::elliptic_curve::sec1::ToEncodedPoint as _;
        match self {
            PublicKey::Ed25519(bytes) => bytes.to_vec(),
            PublicKey::Secp256k1(pk) => pk.to_encoded_point(true).as_bytes().to_vec(),
            PublicKey::Ecdsa(pk) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint as _;
                pk.to_encoded_point(true).as_bytes().to_vec()
            }
        }
    }

    /// Verify a signature made by the paired private key.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        match self {
            PublicKey::Ed25519(bytes) => ed25519::verify(bytes, msg, sig),
            PublicKey::Secp256k1(pk) => secp256k1::verify(pk, msg, sig),
            PublicKey::Ecdsa(pk) => ecdsa::verify(pk, msg, sig),
        }
    }

    /// The WhiteNoiseID for this public key.
    pub fn id(&self) -> WhiteNoiseID {
        WhiteNoiseID::from_public_key(self)
    }

    /// ECIES-encrypt `plaintext` to this key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        ecies::encrypt(self, plaintext)
    }
}

/// A node's long-term identity.
#[derive(Clone)]
pub struct Account {
    keypair: Keypair,
}

impl Account {
    /// Generate an account with the default key type.
    pub fn generate() -> Self {
        Self::with_key_type(DEFAULT_KEY_TYPE)
    }

    /// Generate an account with an explicit key type.
    pub fn with_key_type(key_type: KeyType) -> Self {
        Self {
            keypair: Keypair::generate(key_type),
        }
    }

    /// Deterministic account from seed bytes. Test and tooling use only.
    pub fn from_seed(key_type: KeyType, seed: [u8; 32]) -> Result<Self> {
        Ok(Self {
            keypair: Keypair::from_seed(key_type, seed)?,
        })
    }

    /// The public identity key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The public identifier.
    pub fn whitenoise_id(&self) -> WhiteNoiseID {
        self.public_key().id()
    }

    /// The transport peer id derived from the identity.
    pub fn peer_id(&self) -> PeerId {
        self.whitenoise_id().peer_id()
    }

    /// Sign `msg` with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.keypair.sign(msg)
    }

    /// ECIES-decrypt a ciphertext addressed to this identity.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        ecies::decrypt(&self.keypair, cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_key_types_sign_and_verify() {
        for kt in [KeyType::Ed25519, KeyType::Secp256k1, KeyType::Ecdsa] {
            let acc = Account::with_key_type(kt);
            let sig = acc.sign(b"msg");
            acc.public_key().verify(b"msg", &sig).expect("verify");
        }
    }

    #[test]
    fn test_key_type_tags() {
        assert_eq!(KeyType::from_tag(0).expect("tag"), KeyType::Ed25519);
        assert_eq!(KeyType::from_tag(1).expect("tag"), KeyType::Secp256k1);
        assert_eq!(KeyType::from_tag(2).expect("tag"), KeyType::Ecdsa);
        assert!(KeyType::from_tag(9).is_err());
    }

    #[test]
    fn test_peer_id_stable_for_account() {
        let acc = Account::from_seed(KeyType::Ed25519, [5u8; 32]).expect("seed");
        assert_eq!(acc.peer_id(), acc.whitenoise_id().peer_id());
    }
}
