//! The host abstraction: authenticated framed streams to remote peers.
//!
//! A host owns the node's transport identity and hands out framed streams
//! keyed by protocol. The circuit core consumes nothing else from the
//! transport: `open_stream(peer, protocol)` outbound, a per-protocol
//! channel of [`IncomingStream`]s inbound, and a broadcast of peer
//! departures for eviction hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use whitenoise_types::PeerId;

use crate::framing::FramedStream;
use crate::{Result, TransportError};

/// The four WhiteNoise stream protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Relay,
    Cmd,
    Ack,
    Proxy,
}

impl Protocol {
    /// The protocol id written in stream headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Relay => "/relay",
            Protocol::Cmd => "/cmd",
            Protocol::Ack => "/ack",
            Protocol::Proxy => "/proxy",
        }
    }

    /// Parse a stream header protocol id.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "/relay" => Ok(Protocol::Relay),
            "/cmd" => Ok(Protocol::Cmd),
            "/ack" => Ok(Protocol::Ack),
            "/proxy" => Ok(Protocol::Proxy),
            other => Err(TransportError::ProtocolUnsupported(other.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound stream delivered to a protocol handler.
pub struct IncomingStream {
    pub protocol: Protocol,
    pub remote_peer: PeerId,
    pub stream: FramedStream,
}

/// Authenticated point-to-point stream factory.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// This node's transport identity.
    fn local_peer(&self) -> PeerId;

    /// Open a framed stream to `peer` for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: Protocol) -> Result<FramedStream>;

    /// Claim the inbound channel for `protocol`. Streams arriving for a
    /// protocol nobody registered are refused at the opener.
    fn register_protocol(&self, protocol: Protocol) -> mpsc::Receiver<IncomingStream>;

    /// Subscribe to peer-departure notifications.
    fn subscribe_disconnects(&self) -> broadcast::Receiver<PeerId>;
}
