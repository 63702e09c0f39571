//! The `/proxy` request surface.
//!
//! Entry and exit proxies host registered clients and build circuits on
//! their behalf. The same protocol carries the proxy-to-client callbacks:
//! a proxy never sees negotiation plaintext, so it asks the caller to
//! ECIES-encrypt outbound negotiations and the answer client to decrypt
//! inbound ones. Each request travels on a one-shot stream and completes
//! through the ack registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use whitenoise_crypto::WhiteNoiseID;
use whitenoise_gossip::{GossipBus, PeerDirectory};
use whitenoise_transport::cbor;
use whitenoise_transport::messages::{
    self, Ack, DecryptGossip, EncryptedNeg, MainNetPeers, Negotiate, NegPlaintext, NewCircuit,
    NewProxy, PeersList, Request, RequestKind, UnRegister,
};
use whitenoise_transport::{Host, IncomingStream, Protocol};
use whitenoise_types::{
    NodeInfo, PeerId, ServiceMode, SessionId, SessionRole, DECRYPT_REQUEST_TIMEOUT,
    DIRECTORY_PEERS_MAX, PROXY_LEASE, RETRY_TIMES,
};

use crate::ack::{AckRegistry, AckResult};
use crate::relay::RelayManager;
use crate::{ProtocolError, Result};

/// One hosted client at a proxy.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub whitenoise_id: WhiteNoiseID,
    pub peer_id: PeerId,
    pub lease: Duration,
    pub registered_at: Instant,
}

impl ClientInfo {
    pub fn expired(&self) -> bool {
        self.registered_at.elapsed() >= self.lease
    }
}

/// Proxy-side circuit brokerage plus the client-side crypto callbacks.
pub struct ProxyManager {
    host: Arc<dyn Host>,
    mode: ServiceMode,
    acks: Arc<AckRegistry>,
    relay: Arc<RelayManager>,
    gossip: Option<Arc<dyn GossipBus>>,
    directory: Option<Arc<dyn PeerDirectory>>,
    /// Hosted clients by destination mask (`WhiteNoiseID::hash()`).
    clients: DashMap<String, ClientInfo>,
    /// Inverse index for eviction on peer disconnect.
    clients_by_peer: DashMap<PeerId, WhiteNoiseID>,
    /// Client-side record of dials in flight: session id → dialed identity.
    circuit_tasks: DashMap<SessionId, WhiteNoiseID>,
    retry_times: usize,
}

impl ProxyManager {
    pub fn new(
        host: Arc<dyn Host>,
        mode: ServiceMode,
        acks: Arc<AckRegistry>,
        relay: Arc<RelayManager>,
        gossip: Option<Arc<dyn GossipBus>>,
        directory: Option<Arc<dyn PeerDirectory>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            mode,
            acks,
            relay,
            gossip,
            directory,
            clients: DashMap::new(),
            clients_by_peer: DashMap::new(),
            circuit_tasks: DashMap::new(),
            retry_times: RETRY_TIMES,
        })
    }

    // -- client registry ---------------------------------------------------

    pub fn add_client(&self, info: ClientInfo) {
        self.clients_by_peer
            .insert(info.peer_id, info.whitenoise_id);
        self.clients.insert(info.whitenoise_id.hash(), info);
    }

    pub fn get_client(&self, id_hash: &str) -> Option<ClientInfo> {
        self.clients.get(id_hash).map(|c| c.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Evict a client when its transport peer departs.
    pub fn remove_client_by_peer(&self, peer: &PeerId) {
        if let Some((_, id)) = self.clients_by_peer.remove(peer) {
            self.clients.remove(&id.hash());
        }
    }

    /// Drop clients whose lease has lapsed. Returns the evicted peers.
    pub fn evict_expired(&self) -> Vec<PeerId> {
        let expired: Vec<ClientInfo> = self
            .clients
            .iter()
            .filter(|e| e.value().expired())
            .map(|e| e.value().clone())
            .collect();
        for client in &expired {
            info!(peer = %client.peer_id, "client lease expired");
            self.clients.remove(&client.whitenoise_id.hash());
            self.clients_by_peer.remove(&client.peer_id);
        }
        expired.into_iter().map(|c| c.peer_id).collect()
    }

    /// Record the identity a local dial is addressed to, so the proxy's
    /// NegPlaintext callback can be answered.
    pub fn add_circuit_task(&self, session_id: &SessionId, remote: WhiteNoiseID) {
        self.circuit_tasks.insert(session_id.clone(), remote);
    }

    pub fn remove_circuit_task(&self, session_id: &SessionId) {
        self.circuit_tasks.remove(session_id);
    }

    // -- inbound -----------------------------------------------------------

    /// Drain inbound `/proxy` streams: each carries exactly one request.
    pub async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<IncomingStream>) {
        while let Some(mut incoming) = rx.recv().await {
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                let frame = match incoming.stream.read_msg().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("proxy stream read failed: {e}");
                        return;
                    }
                };
                match Request::decode(&frame) {
                    Ok(request) => {
                        manager
                            .handle_request(&request, incoming.remote_peer)
                            .await;
                    }
                    Err(e) => debug!("proxy request decode failed: {e}"),
                }
            });
        }
    }

    async fn handle_request(&self, request: &Request, from: PeerId) {
        match request.kind {
            RequestKind::MainNetPeers => self.handle_mainnet_peers(request, from).await,
            RequestKind::NewProxy => self.handle_new_proxy(request, from),
            RequestKind::NewCircuit => {
                let ack = match self.handle_new_circuit(request, from).await {
                    Ok(()) => Ack::accept(&request.req_id, Vec::new()),
                    Err(e) => {
                        warn!("new circuit failed: {e}");
                        Ack::reject(&request.req_id, &e.to_string())
                    }
                };
                self.acks.spawn_send_ack(from, ack);
            }
            RequestKind::DecryptGossip => {
                let ack = match self.handle_decrypt(request) {
                    Ok(plain) => Ack::accept(&request.req_id, plain),
                    Err(e) => {
                        debug!("gossip decrypt failed: {e}");
                        Ack::reject(&request.req_id, "decrypt failed")
                    }
                };
                self.acks.spawn_send_ack(from, ack);
            }
            RequestKind::NegPlaintext => {
                let ack = match self.handle_encrypt(request) {
                    Ok(cipher) => Ack::accept(&request.req_id, cipher),
                    Err(e) => {
                        debug!("negotiation encrypt failed: {e}");
                        Ack::reject(&request.req_id, "encrypt failed")
                    }
                };
                self.acks.spawn_send_ack(from, ack);
            }
            RequestKind::UnRegister => {
                debug!(peer = %from, "unregister request");
                self.unregister_client(from).await;
            }
        }
    }

    async fn handle_mainnet_peers(&self, request: &Request, from: PeerId) {
        let Some(directory) = &self.directory else {
            self.acks
                .spawn_send_ack(from, Ack::reject(&request.req_id, "not a directory node"));
            return;
        };
        let ack = match cbor::from_slice::<MainNetPeers>(&request.data) {
            Ok(req) => {
                let max = (req.max as usize).min(DIRECTORY_PEERS_MAX);
                let peers = directory.random_peers(max).await;
                match cbor::to_vec(&PeersList { peers }) {
                    Ok(data) => Ack::accept(&request.req_id, data),
                    Err(e) => Ack::reject(&request.req_id, &format!("peer list encode: {e}")),
                }
            }
            Err(e) => Ack::reject(&request.req_id, &format!("malformed peers request: {e}")),
        };
        self.acks.spawn_send_ack(from, ack);
    }

    fn handle_new_proxy(&self, request: &Request, from: PeerId) {
        if self.mode != ServiceMode::Server {
            self.acks
                .spawn_send_ack(from, Ack::reject(&request.req_id, "not a proxy"));
            return;
        }
        let ack = match cbor::from_slice::<NewProxy>(&request.data) {
            Ok(req) => match req.whitenoise_id.parse::<WhiteNoiseID>() {
                Ok(id) => {
                    if self.get_client(&id.hash()).is_some() {
                        Ack::reject(&request.req_id, "proxy already")
                    } else {
                        let lease = if req.lease_secs == 0 {
                            PROXY_LEASE
                        } else {
                            Duration::from_secs(req.lease_secs)
                        };
                        self.add_client(ClientInfo {
                            whitenoise_id: id,
                            peer_id: from,
                            lease,
                            registered_at: Instant::now(),
                        });
                        info!(peer = %from, "hosting new client");
                        Ack::accept(&request.req_id, Vec::new())
                    }
                }
                Err(e) => Ack::reject(&request.req_id, &format!("bad identity: {e}")),
            },
            Err(e) => Ack::reject(&request.req_id, &format!("malformed register: {e}")),
        };
        self.acks.spawn_send_ack(from, ack);
    }

    /// The entry-side circuit build (§caller's proxy).
    async fn handle_new_circuit(&self, request: &Request, from: PeerId) -> Result<()> {
        if self.mode != ServiceMode::Server {
            return Err(ProtocolError::Rejected("not a proxy".to_string()));
        }
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| ProtocolError::Rejected("no peer directory".to_string()))?;
        let gossip = self
            .gossip
            .as_ref()
            .ok_or_else(|| ProtocolError::Rejected("no gossip bus".to_string()))?;

        let req: NewCircuit = cbor::from_slice(&request.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        // Only a registered client, on its own registered stream, may ask.
        let caller = self
            .get_client(&req.from)
            .filter(|c| c.peer_id == from)
            .ok_or_else(|| ProtocolError::Rejected("caller not registered".to_string()))?;

        let session = self
            .relay
            .get_session(&req.session_id)
            .ok_or_else(|| ProtocolError::Rejected("no stream for this session yet".to_string()))?;
        if session.is_ready() {
            return Err(ProtocolError::Rejected("session is full".to_string()));
        }

        // Caller and answer share this proxy: serve as entry and exit at
        // once and skip the gossip round entirely.
        if let Some(answer) = self.get_client(&req.to) {
            info!(session = %req.session_id, "caller and answer share this proxy");
            if let Err(e) = self
                .relay
                .new_session_to_peer(
                    answer.peer_id,
                    &req.session_id,
                    SessionRole::Exit,
                    SessionRole::Answer,
                )
                .await
            {
                let _ = self.relay.close_circuit(&req.session_id).await;
                return Err(e);
            }
            let success = messages::new_success(&req.session_id)?.encode()?;
            self.relay.send_relay(&req.session_id, &success).await?;
            return Ok(());
        }

        // Pick a joint from the directory, retrying past dead candidates.
        let peers = directory.random_peers(DIRECTORY_PEERS_MAX).await;
        let mut invalid: HashSet<PeerId> = HashSet::new();
        let exclude = [self.host.local_peer(), caller.peer_id];
        let mut joint = None;
        for _ in 0..self.retry_times {
            let Some(candidate) = select_candidate(&peers, &invalid, &exclude, Some(&req.to))
            else {
                break;
            };
            match self
                .relay
                .new_session_to_peer(
                    candidate,
                    &req.session_id,
                    SessionRole::Entry,
                    SessionRole::Joint,
                )
                .await
            {
                Ok(()) => {
                    joint = Some(candidate);
                    break;
                }
                Err(e) => {
                    debug!(candidate = %candidate, "joint candidate failed: {e}");
                    invalid.insert(candidate);
                }
            }
        }
        let Some(joint) = joint else {
            warn!(session = %req.session_id, "no viable joint candidate");
            let _ = self.relay.close_circuit(&req.session_id).await;
            return Err(ProtocolError::Exhausted("cannot find joint node".to_string()));
        };

        // The proxy cannot read the answer's key, so the caller seals the
        // negotiation record for us.
        let neg = Negotiate {
            join: joint,
            session_id: req.session_id.clone(),
            destination: req.to.clone(),
            sig: Vec::new(),
        };
        let neg_bytes = cbor::to_vec(&neg)?;
        let cipher = self
            .encrypt_via_caller(caller.peer_id, &req.session_id, &neg_bytes)
            .await
            .map_err(|e| {
                warn!("caller-side negotiation encrypt failed: {e}");
                e
            })?;

        info!(session = %req.session_id, joint = %joint, "gossiping circuit negotiation");
        let encrypted = EncryptedNeg {
            destination: req.to.clone(),
            cipher,
        };
        if let Err(e) = gossip.publish(cbor::to_vec(&encrypted)?).await {
            let _ = self.relay.close_circuit(&req.session_id).await;
            return Err(e.into());
        }

        // Entry-side probe toward the joint.
        let probe = messages::new_probe(&req.session_id)?.encode()?;
        self.relay.send_relay(&req.session_id, &probe).await?;
        Ok(())
    }

    /// Client-side handler: decrypt a gossiped negotiation with the local
    /// long-term key. Only parseable Negotiate plaintext is returned.
    fn handle_decrypt(&self, request: &Request) -> Result<Vec<u8>> {
        let req: DecryptGossip = cbor::from_slice(&request.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let plain = self.relay.account().decrypt(&req.cipher)?;
        let _: Negotiate =
            cbor::from_slice(&plain).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(plain)
    }

    /// Client-side handler: seal a negotiation record for the identity this
    /// session was dialed to.
    fn handle_encrypt(&self, request: &Request) -> Result<Vec<u8>> {
        let req: NegPlaintext = cbor::from_slice(&request.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let target = self
            .circuit_tasks
            .get(&req.session_id)
            .map(|t| *t.value())
            .ok_or_else(|| ProtocolError::NoSuchSession(req.session_id.clone()))?;
        Ok(target.encrypt(&req.neg)?)
    }

    async fn unregister_client(&self, peer: PeerId) {
        self.remove_client_by_peer(&peer);
        for session_id in self.relay.sessions_with_peer(peer) {
            let _ = self.relay.close_circuit(&session_id).await;
        }
    }

    // -- proxy-to-client requests ------------------------------------------

    /// Ask the caller to ECIES-encrypt `plaintext` for its dialed
    /// destination.
    pub async fn encrypt_via_caller(
        &self,
        caller: PeerId,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let payload = NegPlaintext {
            session_id: session_id.clone(),
            neg: plaintext.to_vec(),
        };
        let result = self
            .request_ack(caller, RequestKind::NegPlaintext, &payload)
            .await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                "caller refused to encrypt negotiation".to_string(),
            ));
        }
        Ok(result.data)
    }

    /// Ask a hosted client to decrypt a gossiped negotiation addressed to
    /// it. Returns the decoded record.
    pub async fn decrypt_via_client(
        &self,
        client: PeerId,
        destination: &str,
        cipher: &[u8],
    ) -> Result<Negotiate> {
        let payload = DecryptGossip {
            destination: destination.to_string(),
            cipher: cipher.to_vec(),
        };
        let result = self
            .request_ack(client, RequestKind::DecryptGossip, &payload)
            .await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                "client could not decrypt negotiation".to_string(),
            ));
        }
        cbor::from_slice(&result.data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Fire-and-forget unregister notice to the proxy this node is hosted
    /// by.
    pub async fn send_unregister(&self, proxy: PeerId, id: &WhiteNoiseID) -> Result<()> {
        let request = Request::new(
            self.host.local_peer(),
            RequestKind::UnRegister,
            &UnRegister {
                whitenoise_id: id.to_string(),
            },
        )?;
        let mut stream = self.host.open_stream(proxy, Protocol::Proxy).await?;
        stream.write_msg(&request.encode()?).await?;
        Ok(())
    }

    async fn request_ack<T: serde::Serialize>(
        &self,
        peer: PeerId,
        kind: RequestKind,
        payload: &T,
    ) -> Result<AckResult> {
        let request = Request::new(self.host.local_peer(), kind, payload)?;
        let mut stream = self.host.open_stream(peer, Protocol::Proxy).await?;

        let waiter = self.acks.add_task(&request.req_id);
        if let Err(e) = stream.write_msg(&request.encode()?).await {
            self.acks.delete_task(&request.req_id);
            return Err(e.into());
        }
        self.acks
            .wait(&request.req_id, waiter, DECRYPT_REQUEST_TIMEOUT)
            .await
    }
}

/// Random-start scan for a viable candidate, skipping blacklisted and
/// excluded peers and (optionally) the peer whose base58 id equals the
/// destination mask.
pub(crate) fn select_candidate(
    peers: &[NodeInfo],
    invalid: &HashSet<PeerId>,
    exclude: &[PeerId],
    exclude_hash: Option<&str>,
) -> Option<PeerId> {
    if peers.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..peers.len());
    for offset in 0..peers.len() {
        let candidate = peers[(start + offset) % peers.len()].id;
        if invalid.contains(&candidate) || exclude.contains(&candidate) {
            continue;
        }
        if let Some(hash) = exclude_hash {
            if candidate.to_base58() == hash {
                continue;
            }
        }
        return Some(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeInfo {
        NodeInfo {
            id: PeerId([n; 32]),
            addrs: vec![],
        }
    }

    #[test]
    fn test_select_candidate_skips_excluded() {
        let peers = vec![node(1), node(2), node(3)];
        let invalid: HashSet<PeerId> = [PeerId([1u8; 32])].into_iter().collect();
        let exclude = [PeerId([2u8; 32])];

        for _ in 0..20 {
            let picked = select_candidate(&peers, &invalid, &exclude, None).expect("candidate");
            assert_eq!(picked, PeerId([3u8; 32]));
        }
    }

    #[test]
    fn test_select_candidate_skips_destination_mask() {
        let peers = vec![node(1), node(2)];
        let mask = PeerId([1u8; 32]).to_base58();
        let picked =
            select_candidate(&peers, &HashSet::new(), &[], Some(&mask)).expect("candidate");
        assert_eq!(picked, PeerId([2u8; 32]));
    }

    #[test]
    fn test_select_candidate_exhausted() {
        let peers = vec![node(1)];
        let invalid: HashSet<PeerId> = [PeerId([1u8; 32])].into_iter().collect();
        assert!(select_candidate(&peers, &invalid, &[], None).is_none());
    }

    #[test]
    fn test_client_info_lease() {
        let acc = whitenoise_crypto::Account::generate();
        let fresh = ClientInfo {
            whitenoise_id: acc.whitenoise_id(),
            peer_id: acc.peer_id(),
            lease: Duration::from_secs(3600),
            registered_at: Instant::now(),
        };
        assert!(!fresh.expired());

        let stale = ClientInfo {
            lease: Duration::from_nanos(1),
            ..fresh
        };
        std::thread::sleep(Duration::from_millis(1));
        assert!(stale.expired());
    }
}
