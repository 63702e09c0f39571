//! In-process mesh host.
//!
//! Connects any number of hosts through in-memory duplex pipes, keyed by
//! peer id. Used by the integration suite (multi-node circuit scenarios in
//! one process) and by the self-circuit demo path. Semantics match the QUIC
//! host: per-protocol inbound channels, refusal when the remote never
//! registered the protocol, and departure notifications when a host leaves
//! the mesh.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use whitenoise_types::PeerId;

use crate::framing::FramedStream;
use crate::host::{Host, IncomingStream, Protocol};
use crate::{Result, TransportError};

const INBOUND_QUEUE: usize = 64;
const PIPE_CAPACITY: usize = 256 * 1024;

struct MemPeer {
    handlers: Arc<DashMap<Protocol, mpsc::Sender<IncomingStream>>>,
    disconnects: broadcast::Sender<PeerId>,
    allowlist: Arc<RwLock<Option<HashSet<PeerId>>>>,
}

/// The shared mesh all [`MemHost`]s attach to.
#[derive(Default)]
pub struct MemNetwork {
    peers: DashMap<PeerId, MemPeer>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a host for `peer` to the mesh.
    pub fn host(self: &Arc<Self>, peer: PeerId) -> Arc<MemHost> {
        let handlers = Arc::new(DashMap::new());
        let (disconnects, _) = broadcast::channel(32);
        let allowlist = Arc::new(RwLock::new(None));
        self.peers.insert(
            peer,
            MemPeer {
                handlers: Arc::clone(&handlers),
                disconnects: disconnects.clone(),
                allowlist: Arc::clone(&allowlist),
            },
        );
        Arc::new(MemHost {
            local: peer,
            network: Arc::clone(self),
            handlers,
            disconnects,
            allowlist,
        })
    }

    /// Detach `peer` and notify everyone else.
    pub fn remove(&self, peer: PeerId) {
        self.peers.remove(&peer);
        for entry in self.peers.iter() {
            let _ = entry.value().disconnects.send(peer);
        }
    }
}

/// One endpoint of the in-process mesh.
pub struct MemHost {
    local: PeerId,
    network: Arc<MemNetwork>,
    handlers: Arc<DashMap<Protocol, mpsc::Sender<IncomingStream>>>,
    disconnects: broadcast::Sender<PeerId>,
    allowlist: Arc<RwLock<Option<HashSet<PeerId>>>>,
}

impl MemHost {
    /// Restrict inbound streams to `peers`. `None` admits everyone.
    pub async fn set_allowlist(&self, peers: Option<HashSet<PeerId>>) {
        *self.allowlist.write().await = peers;
    }

    /// Leave the mesh, notifying the remaining hosts.
    pub fn shutdown(&self) {
        self.network.remove(self.local);
    }
}

#[async_trait::async_trait]
impl Host for MemHost {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId, protocol: Protocol) -> Result<FramedStream> {
        let (handler, allowlist) = {
            let remote = self
                .network
                .peers
                .get(&peer)
                .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
            let handler = remote
                .handlers
                .get(&protocol)
                .map(|h| h.value().clone())
                .ok_or_else(|| {
                    TransportError::ProtocolUnsupported(protocol.as_str().to_string())
                })?;
            (handler, Arc::clone(&remote.allowlist))
        };

        if let Some(allowed) = allowlist.read().await.as_ref() {
            if !allowed.contains(&self.local) {
                return Err(TransportError::NotAllowed(self.local.to_string()));
            }
        }

        let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
        handler
            .send(IncomingStream {
                protocol,
                remote_peer: self.local,
                stream: FramedStream::new(Box::new(remote_end)),
            })
            .await
            .map_err(|_| TransportError::Connection("remote handler closed".to_string()))?;

        Ok(FramedStream::new(Box::new(local_end)))
    }

    fn register_protocol(&self, protocol: Protocol) -> mpsc::Receiver<IncomingStream> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.handlers.insert(protocol, tx);
        rx
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<PeerId> {
        self.disconnects.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    #[tokio::test]
    async fn test_open_stream_delivers_to_handler() {
        let net = MemNetwork::new();
        let a = net.host(peer(1));
        let b = net.host(peer(2));
        let mut inbound = b.register_protocol(Protocol::Relay);

        let mut stream = a.open_stream(peer(2), Protocol::Relay).await.expect("open");
        stream.write_msg(b"hello").await.expect("write");

        let mut incoming = inbound.recv().await.expect("incoming");
        assert_eq!(incoming.remote_peer, peer(1));
        assert_eq!(incoming.stream.read_msg().await.expect("read"), b"hello");
    }

    #[tokio::test]
    async fn test_unregistered_protocol_refused() {
        let net = MemNetwork::new();
        let a = net.host(peer(1));
        let _b = net.host(peer(2));
        let result = a.open_stream(peer(2), Protocol::Proxy).await;
        assert!(matches!(result, Err(TransportError::ProtocolUnsupported(_))));
    }

    #[tokio::test]
    async fn test_unknown_peer_refused() {
        let net = MemNetwork::new();
        let a = net.host(peer(1));
        assert!(matches!(
            a.open_stream(peer(9), Protocol::Relay).await,
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_allowlist_blocks_unlisted_peer() {
        let net = MemNetwork::new();
        let a = net.host(peer(1));
        let b = net.host(peer(2));
        let _inbound = b.register_protocol(Protocol::Relay);
        b.set_allowlist(Some([peer(3)].into_iter().collect())).await;

        assert!(matches!(
            a.open_stream(peer(2), Protocol::Relay).await,
            Err(TransportError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_disconnect_subscribers() {
        let net = MemNetwork::new();
        let a = net.host(peer(1));
        let b = net.host(peer(2));
        let mut departures = a.subscribe_disconnects();

        b.shutdown();
        assert_eq!(departures.recv().await.expect("departure"), peer(2));
    }
}
