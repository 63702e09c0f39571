//! CBOR serialization helpers for the wire message set.
//!
//! Every WhiteNoise protocol message is a `serde` struct encoded as CBOR
//! (RFC 8949) before framing. These wrappers keep the `ciborium` error
//! mapping in one place.

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Deserialization`] if the bytes cannot be
/// deserialized into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data)
        .map_err(|e| TransportError::Deserialization(format!("CBOR deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MainNetPeers;

    #[test]
    fn test_roundtrip() {
        let msg = MainNetPeers { max: 42 };
        let bytes = to_vec(&msg).expect("serialize");
        let restored: MainNetPeers = from_slice(&bytes).expect("deserialize");
        assert_eq!(restored.max, 42);
    }

    #[test]
    fn test_invalid_data_returns_error() {
        let result: Result<MainNetPeers, _> = from_slice(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
