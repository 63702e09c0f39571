//! The gossip consumer: the exit-side half of a circuit build.
//!
//! Server nodes subscribe to the negotiation topic. For each arriving
//! ciphertext the consumer checks whether it hosts a client matching the
//! destination mask, has that client decrypt, and then wires the exit
//! side: a session to the answer client, a relay candidate extended to the
//! announced joint, and the exit-side probe.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use whitenoise_gossip::{GossipBus, PeerDirectory};
use whitenoise_transport::cbor;
use whitenoise_transport::messages::{self, EncryptedNeg};
use whitenoise_types::{PeerId, SessionRole, DIRECTORY_PEERS_MAX, RETRY_TIMES};

use crate::command::CmdManager;
use crate::proxy::{select_candidate, ClientInfo, ProxyManager};
use crate::relay::RelayManager;

/// Drives exit-side circuit builds off the negotiation topic.
pub struct GossipConsumer {
    relay: Arc<RelayManager>,
    proxy: Arc<ProxyManager>,
    cmd: Arc<CmdManager>,
    directory: Arc<dyn PeerDirectory>,
    local_peer: PeerId,
    retry_times: usize,
}

impl GossipConsumer {
    pub fn new(
        relay: Arc<RelayManager>,
        proxy: Arc<ProxyManager>,
        cmd: Arc<CmdManager>,
        directory: Arc<dyn PeerDirectory>,
        local_peer: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            proxy,
            cmd,
            directory,
            local_peer,
            retry_times: RETRY_TIMES,
        })
    }

    /// Consume the negotiation topic until the bus closes.
    pub async fn run(self: Arc<Self>, bus: Arc<dyn GossipBus>) {
        let mut rx = bus.subscribe().await;
        while let Some(msg) = rx.recv().await {
            let encrypted: EncryptedNeg = match cbor::from_slice(&msg.data) {
                Ok(encrypted) => encrypted,
                Err(e) => {
                    // The topic tolerates unknown senders; skip quietly.
                    debug!(id = %msg.id, "undecodable gossip message: {e}");
                    continue;
                }
            };
            let Some(client) = self.proxy.get_client(&encrypted.destination) else {
                continue;
            };
            debug!(peer = %client.peer_id, "negotiation addressed to a hosted client");
            let consumer = Arc::clone(&self);
            tokio::spawn(async move { consumer.handle_negotiation(client, encrypted).await });
        }
    }

    async fn handle_negotiation(&self, client: ClientInfo, msg: EncryptedNeg) {
        let neg = match self
            .proxy
            .decrypt_via_client(client.peer_id, &msg.destination, &msg.cipher)
            .await
        {
            Ok(neg) => neg,
            Err(e) => {
                debug!("client-side negotiation decrypt failed: {e}");
                return;
            }
        };
        let session_id = neg.session_id.clone();
        info!(session = %session_id, joint = %neg.join, "building exit side");

        // Exit → Answer leg first; without it there is nothing to join.
        if let Err(e) = self
            .relay
            .new_session_to_peer(
                client.peer_id,
                &session_id,
                SessionRole::Exit,
                SessionRole::Answer,
            )
            .await
        {
            error!(session = %session_id, "session to answer failed: {e}");
            let _ = self.relay.close_circuit(&session_id).await;
            return;
        }

        // Joint and exit collide: this node already holds both legs, so the
        // circuit is complete without a relay.
        if neg.join == self.local_peer {
            info!(session = %session_id, "acting as both joint and exit");
            match messages::new_success(&session_id).and_then(|m| m.encode()) {
                Ok(frame) => {
                    if let Err(e) = self.relay.send_relay(&session_id, &frame).await {
                        error!("success send failed: {e}");
                    }
                }
                Err(e) => error!("success encode failed: {e}"),
            }
            return;
        }

        // Pick a relay candidate, retrying past dead peers.
        let peers = self.directory.random_peers(DIRECTORY_PEERS_MAX).await;
        let mut invalid: HashSet<PeerId> = HashSet::new();
        let exclude = [self.local_peer, neg.join];
        let mut relay_peer = None;
        for _ in 0..self.retry_times {
            let Some(candidate) = select_candidate(&peers, &invalid, &exclude, None) else {
                break;
            };
            match self
                .relay
                .new_session_to_peer(
                    candidate,
                    &session_id,
                    SessionRole::Exit,
                    SessionRole::Relay,
                )
                .await
            {
                Ok(()) => {
                    relay_peer = Some(candidate);
                    break;
                }
                Err(e) => {
                    debug!(candidate = %candidate, "relay candidate failed: {e}");
                    invalid.insert(candidate);
                }
            }
        }
        let Some(relay_peer) = relay_peer else {
            error!(session = %session_id, "no viable relay candidate");
            let _ = self.relay.close_circuit(&session_id).await;
            return;
        };
        debug!(session = %session_id, relay = %relay_peer, "relay candidate bound");

        // Extend the relay to the announced joint.
        if let Err(e) = self
            .cmd
            .expand_session(relay_peer, neg.join, &session_id)
            .await
        {
            error!(session = %session_id, "session expand failed: {e}");
            let _ = self.relay.close_circuit(&session_id).await;
            return;
        }
        info!(session = %session_id, relay = %relay_peer, "exit side wired");

        // Exit-side probe toward the joint.
        match messages::new_probe(&session_id).and_then(|m| m.encode()) {
            Ok(frame) => {
                if let Err(e) = self.relay.send_relay(&session_id, &frame).await {
                    warn!(session = %session_id, "probe send failed: {e}");
                }
            }
            Err(e) => error!("probe encode failed: {e}"),
        }
    }
}
