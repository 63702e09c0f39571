//! # whitenoise-gossip
//!
//! The two discovery seams the circuit core consumes:
//!
//! - [`bus`] - the pubsub bus carrying encrypted circuit negotiations on
//!   the fixed `noise_topic`, with SHA-256 message ids for mesh-wide
//!   deduplication
//! - [`directory`] - the peer directory behind joint/relay candidate
//!   selection and bootstrap peer listings (`random_peers(max)`,
//!   `refresh()`), standing in for the DHT routing table

pub mod bus;
pub mod directory;

pub use bus::{GossipBus, GossipMessage, MemGossip, NOISE_TOPIC};
pub use directory::{PeerDirectory, StaticPeerDirectory};

/// Error types for gossip operations.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// The bus has no live subscribers or is shut down.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Result type alias for gossip operations.
pub type Result<T> = std::result::Result<T, GossipError>;
