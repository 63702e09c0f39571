//! The peer directory behind candidate selection.
//!
//! Joint and relay candidates come from the node's view of the network.
//! The circuit core only ever asks for a bounded random sample and an
//! occasional refresh, so the directory is a narrow seam: a production
//! node backs it with its routing table, the test mesh with a static map.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use whitenoise_types::{NodeInfo, PeerId};

/// Source of relay-capable peers.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    /// Up to `max` known peers, in random order.
    async fn random_peers(&self, max: usize) -> Vec<NodeInfo>;

    /// Kick a background refresh of the underlying table. Best-effort.
    async fn refresh(&self);
}

/// A directory over a fixed, explicitly managed peer set.
#[derive(Default)]
pub struct StaticPeerDirectory {
    nodes: DashMap<PeerId, NodeInfo>,
}

impl StaticPeerDirectory {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Add or replace a peer record.
    pub fn add_node(&self, info: NodeInfo) {
        self.nodes.insert(info.id, info);
    }

    /// Drop a peer record.
    pub fn remove_node(&self, peer: &PeerId) {
        self.nodes.remove(peer);
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn random_peers(&self, max: usize) -> Vec<NodeInfo> {
        let mut peers: Vec<NodeInfo> = self.nodes.iter().map(|e| e.value().clone()).collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(max);
        peers
    }

    async fn refresh(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeInfo {
        NodeInfo {
            id: PeerId([n; 32]),
            addrs: vec![format!("10.0.0.{n}:4001")],
        }
    }

    #[tokio::test]
    async fn test_random_peers_bounded() {
        let dir = StaticPeerDirectory::new();
        for n in 1..=10 {
            dir.add_node(node(n));
        }
        assert_eq!(dir.random_peers(3).await.len(), 3);
        assert_eq!(dir.random_peers(100).await.len(), 10);
    }

    #[tokio::test]
    async fn test_remove_node() {
        let dir = StaticPeerDirectory::new();
        dir.add_node(node(1));
        dir.add_node(node(2));
        dir.remove_node(&PeerId([1u8; 32]));
        let peers = dir.random_peers(10).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, PeerId([2u8; 32]));
    }
}
