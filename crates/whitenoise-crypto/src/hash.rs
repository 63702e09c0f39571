//! SHA-256 helpers.
//!
//! Protocol identifiers (message ids, session ids, destination hashes, probe
//! tokens) are all SHA-256 digests; the string form is base58.

use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of `data`, base58-encoded. The canonical id form.
pub fn sha256_b58(data: &[u8]) -> String {
    bs58::encode(sha256(data)).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_b58_deterministic() {
        assert_eq!(sha256_b58(b"whitenoise"), sha256_b58(b"whitenoise"));
        assert_ne!(sha256_b58(b"a"), sha256_b58(b"b"));
    }
}
