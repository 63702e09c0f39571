//! ECIES encryption to a WhiteNoise identity.
//!
//! Used to seal the circuit negotiation record to the destination's
//! long-term public key before it is gossiped. The scheme is
//! ECDH-ChaCha20Poly1305 with BLAKE3 key derivation:
//!
//! ```text
//! Encrypt(recipient_pk, plaintext):
//!   1. (eph_sk, eph_pk) = fresh keypair on the recipient's curve
//!   2. shared = ECDH(eph_sk, recipient_pk)
//!   3. key   = BLAKE3::derive_key("whitenoise v1 ecies-key",
//!              shared || eph_pk || recipient_pk)
//!   4. nonce = BLAKE3::derive_key("whitenoise v1 ecies-nonce",
//!              shared || eph_pk)[..12]
//!   5. return eph_pk || ChaCha20Poly1305(key, nonce, plaintext, aad=eph_pk)
//! ```
//!
//! Ed25519 identities are mapped to X25519 for the ECDH; Secp256k1 and
//! P-256 identities run ECDH on their native curve. The ephemeral key
//! length (32 or 33 bytes) is implied by the recipient's key type, so the
//! ciphertext needs no extra framing.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;

use crate::account::{Keypair, PublicKey};
use crate::ed25519;
use crate::{CryptoError, Result};

const ECIES_KEY_CONTEXT: &str = "whitenoise v1 ecies-key";
const ECIES_NONCE_CONTEXT: &str = "whitenoise v1 ecies-nonce";

/// Poly1305 tag length appended to the ciphertext.
pub const TAG_LENGTH: usize = 16;

fn derive_key_nonce(shared: &[u8], eph_pk: &[u8], recipient_pk: &[u8]) -> ([u8; 32], [u8; 12]) {
    let mut key_material = Vec::with_capacity(shared.len() + eph_pk.len() + recipient_pk.len());
    key_material.extend_from_slice(shared);
    key_material.extend_from_slice(eph_pk);
    key_material.extend_from_slice(recipient_pk);
    let key = blake3::derive_key(ECIES_KEY_CONTEXT, &key_material);

    let mut nonce_material = Vec::with_capacity(shared.len() + eph_pk.len());
    nonce_material.extend_from_slice(shared);
    nonce_material.extend_from_slice(eph_pk);
    let nonce_full = blake3::derive_key(ECIES_NONCE_CONTEXT, &nonce_material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_full[..12]);

    (key, nonce)
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Ecies("aead seal failed".into()))
}

fn open(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Ecies("aead open failed".into()))
}

/// Encrypt `plaintext` to `recipient`.
pub fn encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient_bytes = recipient.key_bytes();
    let (eph_pk, shared): (Vec<u8>, Vec<u8>) = match recipient {
        PublicKey::Ed25519(bytes) => {
            let target = ed25519::x25519_public(bytes)?;
            let eph = x25519_dalek::StaticSecret::random_from_rng(OsRng);
            let eph_pk = x25519_dalek::PublicKey::from(&eph);
            let shared = eph.diffie_hellman(&target);
            (eph_pk.as_bytes().to_vec(), shared.as_bytes().to_vec())
        }
        PublicKey::Secp256k1(pk) => {
            use k256::elliptic_curve::sec1::ToEncodedPoint as _;
            let eph = k256::ecdh::EphemeralSecret::random(&mut OsRng);
            let eph_pk = eph.public_key().to_encoded_point(true).as_bytes().to_vec();
            let shared = eph.diffie_hellman(pk);
            (eph_pk, shared.raw_secret_bytes().to_vec())
        }
        PublicKey::Ecdsa(pk) => {
            use p256::elliptic_curve::sec1::ToEncodedPoint as _;
            let eph = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let eph_pk = eph.public_key().to_encoded_point(true).as_bytes().to_vec();
            let shared = eph.diffie_hellman(pk);
            (eph_pk, shared.raw_secret_bytes().to_vec())
        }
    };

    let (key, nonce) = derive_key_nonce(&shared, &eph_pk, &recipient_bytes);
    let sealed = seal(&key, &nonce, &eph_pk, plaintext)?;

    let mut out = Vec::with_capacity(eph_pk.len() + sealed.len());
    out.extend_from_slice(&eph_pk);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt an ECIES ciphertext addressed to `keypair`.
pub fn decrypt(keypair: &Keypair, cipher: &[u8]) -> Result<Vec<u8>> {
    let eph_len = match keypair {
        Keypair::Ed25519(_) => 32,
        Keypair::Secp256k1(_) | Keypair::Ecdsa(_) => 33,
    };
    if cipher.len() < eph_len + TAG_LENGTH {
        return Err(CryptoError::Ecies("ciphertext too short".into()));
    }
    let (eph_pk, sealed) = cipher.split_at(eph_len);
    let recipient_bytes = keypair.public().key_bytes();

    let shared: Vec<u8> = match keypair {
        Keypair::Ed25519(kp) => {
            let eph: [u8; 32] = eph_pk
                .try_into()
                .map_err(|_| CryptoError::Ecies("bad ephemeral key".into()))?;
            let eph = x25519_dalek::PublicKey::from(eph);
            kp.x25519_secret().diffie_hellman(&eph).as_bytes().to_vec()
        }
        Keypair::Secp256k1(kp) => {
            let eph = k256::PublicKey::from_sec1_bytes(eph_pk)
                .map_err(|_| CryptoError::Ecies("bad ephemeral key".into()))?;
            let shared =
                k256::ecdh::diffie_hellman(kp.secret().to_nonzero_scalar(), eph.as_affine());
            shared.raw_secret_bytes().to_vec()
        }
        Keypair::Ecdsa(kp) => {
            let eph = p256::PublicKey::from_sec1_bytes(eph_pk)
                .map_err(|_| CryptoError::Ecies("bad ephemeral key".into()))?;
            let shared =
                p256::ecdh::diffie_hellman(kp.secret().to_nonzero_scalar(), eph.as_affine());
            shared.raw_secret_bytes().to_vec()
        }
    };

    let (key, nonce) = derive_key_nonce(&shared, eph_pk, &recipient_bytes);
    open(&key, &nonce, eph_pk, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, KeyType};

    #[test]
    fn test_roundtrip_all_key_types() {
        for kt in [KeyType::Ed25519, KeyType::Secp256k1, KeyType::Ecdsa] {
            let acc = Account::with_key_type(kt);
            let cipher = encrypt(&acc.public_key(), b"negotiate record").expect("encrypt");
            let plain = acc.decrypt(&cipher).expect("decrypt");
            assert_eq!(plain, b"negotiate record");
        }
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let alice = Account::generate();
        let bob = Account::generate();
        let cipher = encrypt(&alice.public_key(), b"secret").expect("encrypt");
        assert!(bob.decrypt(&cipher).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let acc = Account::generate();
        let cipher = encrypt(&acc.public_key(), b"secret").expect("encrypt");
        assert!(acc.decrypt(&cipher[..20]).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let acc = Account::generate();
        let cipher = encrypt(&acc.public_key(), b"").expect("encrypt");
        let plain = acc.decrypt(&cipher).expect("decrypt");
        assert!(plain.is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let acc = Account::generate();
        let mut cipher = encrypt(&acc.public_key(), b"secret").expect("encrypt");
        let last = cipher.len() - 1;
        cipher[last] ^= 0x01;
        assert!(acc.decrypt(&cipher).is_err());
    }

    #[test]
    fn test_encrypt_via_id() {
        let acc = Account::generate();
        let id = acc.whitenoise_id();
        let cipher = id.encrypt(b"via id").expect("encrypt");
        assert_eq!(acc.decrypt(&cipher).expect("decrypt"), b"via id");
    }
}
