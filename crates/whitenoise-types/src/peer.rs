//! Transport-layer peer identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque 32-byte identifier of a transport-layer endpoint.
///
/// Peer ids are derived from the node's public identity key (SHA-256 of the
/// key-type-tagged encoding) and rendered as base58 in logs and listings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base58 rendering, the canonical string form.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Error parsing a peer id from its base58 string form.
#[derive(Debug, thiserror::Error)]
#[error("invalid peer id: {0}")]
pub struct InvalidPeerId(String);

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| InvalidPeerId(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| InvalidPeerId(format!("expected 32 bytes in {s}")))?;
        Ok(Self(bytes))
    }
}

/// Addressing record for one peer, as returned by peer listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The peer's transport identifier.
    pub id: PeerId,
    /// Dialable addresses, serialized socket addresses.
    pub addrs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_base58_roundtrip() {
        let id = PeerId([7u8; 32]);
        let s = id.to_string();
        let parsed: PeerId = s.parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_rejects_short_input() {
        let result: Result<PeerId, _> = "3yZe7d".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_node_info_serde() {
        let info = NodeInfo {
            id: PeerId([1u8; 32]),
            addrs: vec!["127.0.0.1:4001".to_string()],
        };
        let json = serde_json::to_string(&info).expect("serialize");
        let restored: NodeInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(info, restored);
    }
}
