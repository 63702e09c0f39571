//! The `/relay` protocol handler.
//!
//! Every relay stream gets an inbound task dispatching the six message
//! kinds. Forwarding hops shuttle frames to the pattern leg of the stream
//! they arrived on; endpoints terminate Data into their circuit connection.
//! The joint pairs probe signals and emits CircuitSuccess when both legs
//! prove wired to the same circuit.
//!
//! The manager also owns the node's session, stream, probe, circuit, and
//! secure-session maps, and the outbound `NewSessionToPeer` path used by
//! every role that extends a circuit.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use whitenoise_crypto::{Account, WhiteNoiseID};
use whitenoise_secure::{secure_answer, secure_caller, CircuitIo, SecureSession};
use whitenoise_transport::framing::FramedReader;
use whitenoise_transport::messages::{
    self, Ack, CircuitSuccess, Disconnect, ProbeSignal, Relay, RelayKind, RelayMsg,
    SetSessionIdMsg,
};
use whitenoise_transport::{Host, IncomingStream, Protocol};
use whitenoise_types::{
    PeerId, ServiceMode, SessionId, SessionRole, StreamId, SET_SESSION_TIMEOUT,
};

use crate::ack::AckRegistry;
use crate::connection::CircuitConn;
use crate::session::{PendingProbe, RelayStream, Session, StreamInfo};
use crate::{NodeEvent, ProtocolError, Result};

/// Owner of all per-hop circuit state and the `/relay` dispatcher.
pub struct RelayManager {
    host: Arc<dyn Host>,
    mode: ServiceMode,
    account: Account,
    acks: Arc<AckRegistry>,
    sessions: DashMap<SessionId, Session>,
    streams: DashMap<StreamId, StreamInfo>,
    probes: DashMap<SessionId, Vec<u8>>,
    circuits: DashMap<SessionId, Arc<CircuitConn>>,
    secures: DashMap<SessionId, Arc<SecureSession>>,
    events: broadcast::Sender<NodeEvent>,
}

impl RelayManager {
    pub fn new(
        host: Arc<dyn Host>,
        mode: ServiceMode,
        account: Account,
        acks: Arc<AckRegistry>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            mode,
            account,
            acks,
            sessions: DashMap::new(),
            streams: DashMap::new(),
            probes: DashMap::new(),
            circuits: DashMap::new(),
            secures: DashMap::new(),
            events,
        })
    }

    // -- bookkeeping -------------------------------------------------------

    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn add_session(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn set_role(&self, id: &SessionId, role: SessionRole) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.role = role;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session ids currently tracked, for diagnostics and eviction sweeps.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn add_stream(&self, stream: RelayStream) {
        self.streams.insert(
            stream.id,
            StreamInfo {
                stream,
                session_id: None,
            },
        );
    }

    pub fn get_stream(&self, id: StreamId) -> Option<StreamInfo> {
        self.streams.get(&id).map(|s| s.clone())
    }

    pub fn delete_stream(&self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Streams bound to sessions whose remote end is `peer`.
    pub fn sessions_with_peer(&self, peer: PeerId) -> Vec<SessionId> {
        self.streams
            .iter()
            .filter(|e| e.value().stream.remote_peer == peer)
            .filter_map(|e| e.value().session_id.clone())
            .collect()
    }

    /// Retroactively bind an admitted stream to a session.
    pub fn bind_stream_session(&self, stream_id: StreamId, session_id: &SessionId) {
        if let Some(mut info) = self.streams.get_mut(&stream_id) {
            info.session_id = Some(session_id.clone());
        }
    }

    pub fn get_circuit(&self, id: &SessionId) -> Option<Arc<CircuitConn>> {
        self.circuits.get(id).map(|c| Arc::clone(&c))
    }

    pub fn get_secure(&self, id: &SessionId) -> Option<Arc<SecureSession>> {
        self.secures.get(id).map(|s| Arc::clone(&s))
    }

    /// Create the caller-side circuit connection for a dial in progress.
    pub fn add_circuit_caller(self: &Arc<Self>, session_id: &SessionId, remote: WhiteNoiseID) {
        self.circuits.entry(session_id.clone()).or_insert_with(|| {
            CircuitConn::new(
                Arc::downgrade(self),
                session_id.clone(),
                self.account.whitenoise_id(),
                Some(remote),
            )
        });
    }

    /// Create the answer-side circuit connection; the remote identity is
    /// learned from the end-to-end handshake.
    pub fn add_circuit_answer(self: &Arc<Self>, session_id: &SessionId) {
        self.circuits.entry(session_id.clone()).or_insert_with(|| {
            CircuitConn::new(
                Arc::downgrade(self),
                session_id.clone(),
                self.account.whitenoise_id(),
                None,
            )
        });
    }

    /// Tear down every resource referenced by `session_id`.
    pub fn remove_session(&self, session_id: &SessionId) {
        if let Some((_, secure)) = self.secures.remove(session_id) {
            tokio::spawn(async move { secure.close().await });
        }
        if let Some((_, conn)) = self.circuits.remove(session_id) {
            conn.close();
        }
        if let Some((_, session)) = self.sessions.remove(session_id) {
            for stream in &session.pair {
                stream.close();
                self.streams.remove(&stream.id);
            }
            let _ = self.events.send(NodeEvent::CircuitClosed {
                session_id: session_id.clone(),
            });
        }
        self.probes.remove(session_id);
    }

    // -- outbound ----------------------------------------------------------

    /// Write `frame` to every leg of the session's pair. Any write failure
    /// tears the circuit down.
    pub async fn send_relay(&self, session_id: &SessionId, frame: &[u8]) -> Result<()> {
        let pair = self
            .sessions
            .get(session_id)
            .map(|s| s.pair.clone())
            .ok_or_else(|| ProtocolError::NoSuchSession(session_id.clone()))?;
        if pair.is_empty() {
            return Err(ProtocolError::SessionNotReady(session_id.clone()));
        }
        for stream in pair {
            if let Err(e) = stream.write_msg(frame).await {
                error!(session = %session_id, stream = %stream.id, "relay write failed: {e}");
                let _ = self.close_circuit(session_id).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write `frame` to every leg except the one facing `from`. Never
    /// reflects a message back toward its sender.
    pub async fn forward_relay(
        &self,
        session_id: &SessionId,
        frame: &[u8],
        from: PeerId,
    ) -> Result<()> {
        let pair = self
            .sessions
            .get(session_id)
            .map(|s| s.pair.clone())
            .ok_or_else(|| ProtocolError::NoSuchSession(session_id.clone()))?;
        for stream in pair {
            if stream.remote_peer == from {
                continue;
            }
            stream.write_msg(frame).await?;
        }
        Ok(())
    }

    /// Best-effort Disconnect on every leg; delivery failures do not abort
    /// the cleanup that follows.
    pub async fn send_disconnect(&self, session_id: &SessionId) {
        let frame = match messages::new_disconnect(session_id).and_then(|m| m.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                error!("disconnect encode failed: {e}");
                return;
            }
        };
        let pair = match self.sessions.get(session_id) {
            Some(session) => session.pair.clone(),
            None => return,
        };
        for stream in pair {
            if let Err(e) = stream.write_msg(&frame).await {
                debug!(stream = %stream.id, "disconnect write failed: {e}");
            }
        }
    }

    /// Tear down the circuit: best-effort Disconnect on all legs, then
    /// remove the session.
    pub async fn close_circuit(&self, session_id: &SessionId) -> Result<()> {
        info!(session = %session_id, "closing circuit");
        let existed = self.sessions.contains_key(session_id);
        if existed {
            self.send_disconnect(session_id).await;
        }
        self.remove_session(session_id);
        if existed {
            Ok(())
        } else {
            Err(ProtocolError::NoSuchSession(session_id.clone()))
        }
    }

    /// Open a fresh relay stream to `peer`: wake it and start its inbound
    /// task. Returns the local stream id.
    pub async fn new_relay_stream(self: &Arc<Self>, peer: PeerId) -> Result<StreamId> {
        let stream = self.host.open_stream(peer, Protocol::Relay).await?;
        let (reader, writer) = stream.split();
        let relay_stream = RelayStream::new(peer, writer);
        let id = relay_stream.id;
        self.add_stream(relay_stream.clone());
        self.spawn_inbound(relay_stream.clone(), reader);
        relay_stream
            .write_msg(&messages::new_wake()?.encode()?)
            .await?;
        debug!(stream = %id, remote = %peer, "opened relay stream");
        Ok(id)
    }

    /// Open a relay stream to `peer` and bind it into `session_id` with the
    /// given roles: this node as `my_role`, the remote as `other_role`.
    pub async fn new_session_to_peer(
        self: &Arc<Self>,
        peer: PeerId,
        session_id: &SessionId,
        my_role: SessionRole,
        other_role: SessionRole,
    ) -> Result<()> {
        let stream_id = self.new_relay_stream(peer).await?;
        self.set_session_id(session_id, stream_id, my_role, other_role)
            .await
    }

    /// Run the SetSessionId exchange on an already-open stream and record
    /// the binding locally once the remote acks.
    pub async fn set_session_id(
        self: &Arc<Self>,
        session_id: &SessionId,
        stream_id: StreamId,
        my_role: SessionRole,
        other_role: SessionRole,
    ) -> Result<()> {
        let info = self
            .get_stream(stream_id)
            .ok_or(ProtocolError::NoSuchStream(stream_id))?;

        let msg = messages::new_set_session(session_id, other_role)?;
        let waiter = self.acks.add_task(&msg.id);
        if let Err(e) = info.stream.write_msg(&msg.encode()?).await {
            self.acks.delete_task(&msg.id);
            return Err(e);
        }

        let result = self.acks.wait(&msg.id, waiter, SET_SESSION_TIMEOUT).await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                String::from_utf8_lossy(&result.data).into_owned(),
            ));
        }

        let mut session = self
            .get_session(session_id)
            .unwrap_or_else(|| Session::new(session_id.clone(), my_role));
        session.add_stream(info.stream.clone());
        let ready = session.is_ready();
        self.add_session(session);
        self.bind_stream_session(stream_id, session_id);
        debug!(session = %session_id, stream = %stream_id, role = %my_role, "session leg bound");
        if ready {
            self.flush_pending_probe(session_id).await;
        }
        Ok(())
    }

    // -- inbound -----------------------------------------------------------

    /// Admit streams arriving on the `/relay` protocol.
    pub async fn run_acceptor(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<IncomingStream>,
    ) {
        while let Some(incoming) = rx.recv().await {
            debug!(remote = %incoming.remote_peer, "new inbound relay stream");
            let (reader, writer) = incoming.stream.split();
            let stream = RelayStream::new(incoming.remote_peer, writer);
            self.add_stream(stream.clone());
            self.spawn_inbound(stream, reader);
        }
    }

    fn spawn_inbound(self: &Arc<Self>, stream: RelayStream, reader: FramedReader) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_inbound(stream, reader).await });
    }

    async fn run_inbound(self: Arc<Self>, stream: RelayStream, mut reader: FramedReader) {
        let cancel = stream.cancel_token();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(stream = %stream.id, "inbound task cancelled");
                    return;
                }
                read = reader.read_msg() => match read {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(stream = %stream.id, "relay stream read ended: {e}");
                        self.on_stream_closed(&stream).await;
                        return;
                    }
                },
            };

            let relay = match Relay::decode(&frame) {
                Ok(relay) => relay,
                Err(e) => {
                    error!(stream = %stream.id, "relay decode failed: {e}");
                    continue;
                }
            };

            match relay.kind {
                RelayKind::Wake => debug!(stream = %stream.id, "stream awake"),
                RelayKind::SetSessionId => {
                    if let Err(e) = self.handle_set_session(&relay, &stream).await {
                        warn!(stream = %stream.id, "set-session failed: {e}");
                    }
                }
                RelayKind::Data => {
                    if let Err(e) = self.handle_data(&relay, &stream, &frame).await {
                        error!(stream = %stream.id, "relay data failed: {e}");
                    }
                }
                RelayKind::Probe => {
                    if let Err(e) = self.handle_probe(&relay, &stream, &frame).await {
                        error!(stream = %stream.id, "probe handling failed: {e}");
                    }
                }
                RelayKind::Success => {
                    // The success path starts the end-to-end handshake whose
                    // frames arrive as Data on this same stream; it must not
                    // block the dispatcher.
                    let manager = Arc::clone(&self);
                    let relay = relay.clone();
                    let stream = stream.clone();
                    let frame = frame.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle_success(&relay, &stream, &frame).await {
                            error!("circuit success handling failed: {e}");
                        }
                    });
                }
                RelayKind::Disconnect => {
                    if let Err(e) = self.handle_disconnect(&relay, &stream, &frame).await {
                        debug!(stream = %stream.id, "disconnect handling: {e}");
                    }
                }
                RelayKind::Ack => {}
            }
        }
    }

    /// Transport-observed closure: unbind the stream and, if it belonged to
    /// a session, propagate the teardown to the peer side.
    async fn on_stream_closed(&self, stream: &RelayStream) {
        stream.close();
        let bound = self
            .streams
            .get(&stream.id)
            .and_then(|info| info.session_id.clone());
        self.streams.remove(&stream.id);
        if let Some(session_id) = bound {
            if self.sessions.contains_key(&session_id) {
                let _ = self.close_circuit(&session_id).await;
            }
        }
    }

    async fn handle_set_session(self: &Arc<Self>, relay: &Relay, stream: &RelayStream) -> Result<()> {
        let msg: SetSessionIdMsg = match whitenoise_transport::cbor::from_slice(&relay.data) {
            Ok(msg) => msg,
            Err(e) => {
                self.acks.spawn_send_ack(
                    stream.remote_peer,
                    Ack::reject(&relay.id, &format!("malformed set-session: {e}")),
                );
                return Err(ProtocolError::Decode(e.to_string()));
            }
        };

        // Client mode serves as endpoint only: nobody drafts a client into
        // relay duties.
        if self.mode == ServiceMode::Client && msg.role != SessionRole::Answer {
            self.acks
                .spawn_send_ack(stream.remote_peer, Ack::reject(&relay.id, "reject"));
            return Err(ProtocolError::Rejected("reject".to_string()));
        }

        // The entry-acts-as-relay collapse: this node is already Entry for
        // a ready session and the exit side now asks it to serve as Relay
        // for the same circuit. The joint it picked was itself; drop the
        // superseded joint leg and wire the new stream into slot 1.
        if let Some(session) = self.get_session(&msg.session_id) {
            if session.role == SessionRole::Entry && msg.role == SessionRole::Relay {
                warn!(session = %msg.session_id, "acting as both entry and relay");
                if session.is_ready() {
                    let joint_leg = session.pair[1].clone();
                    if let Ok(dis) = messages::new_disconnect(&msg.session_id) {
                        if let Ok(frame) = dis.encode() {
                            let _ = joint_leg.write_msg(&frame).await;
                        }
                    }
                    joint_leg.close();
                    self.delete_stream(joint_leg.id);

                    if let Some(mut entry) = self.sessions.get_mut(&msg.session_id) {
                        entry.pair[1] = stream.clone();
                    }
                    self.bind_stream_session(stream.id, &msg.session_id);
                    self.acks
                        .spawn_send_ack(stream.remote_peer, Ack::accept(&relay.id, Vec::new()));
                    return Ok(());
                }
                let _ = self.close_circuit(&msg.session_id).await;
                return Err(ProtocolError::SessionNotReady(msg.session_id));
            }
        }

        if msg.role == SessionRole::Answer {
            // The answer endpoint needs its circuit connection in place
            // before the success signal arrives.
            self.add_circuit_answer(&msg.session_id);
        }

        let mut session = self
            .get_session(&msg.session_id)
            .unwrap_or_else(|| Session::new(msg.session_id.clone(), msg.role));
        session.add_stream(stream.clone());
        let ready = session.is_ready();
        self.add_session(session);
        self.bind_stream_session(stream.id, &msg.session_id);
        debug!(session = %msg.session_id, stream = %stream.id, role = %msg.role, "bound inbound session leg");

        self.acks
            .spawn_send_ack(stream.remote_peer, Ack::accept(&relay.id, Vec::new()));
        if ready {
            self.flush_pending_probe(&msg.session_id).await;
        }
        Ok(())
    }

    async fn handle_data(&self, relay: &Relay, stream: &RelayStream, frame: &[u8]) -> Result<()> {
        let msg: RelayMsg = whitenoise_transport::cbor::from_slice(&relay.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let Some(session) = self.get_session(&msg.session_id) else {
            warn!(session = %msg.session_id, "relay data for unknown session");
            return Ok(());
        };

        if session.role.is_endpoint() {
            match self.get_circuit(&msg.session_id) {
                Some(conn) => conn.inbound(&msg.data).await,
                None => warn!(
                    session = %msg.session_id,
                    "data for endpoint session without circuit connection"
                ),
            }
            return Ok(());
        }

        if session.is_ready() {
            let pattern = match session.pattern(stream.id) {
                Ok(pattern) => pattern,
                Err(e) => {
                    let _ = self.close_circuit(&msg.session_id).await;
                    return Err(e);
                }
            };
            if let Err(e) = pattern.write_msg(frame).await {
                let _ = self.close_circuit(&msg.session_id).await;
                return Err(e);
            }
        } else {
            warn!(session = %msg.session_id, "dropping data for unready session");
        }
        Ok(())
    }

    async fn handle_probe(&self, relay: &Relay, stream: &RelayStream, frame: &[u8]) -> Result<()> {
        let probe: ProbeSignal = whitenoise_transport::cbor::from_slice(&relay.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let Some(session) = self.get_session(&probe.session_id) else {
            warn!(session = %probe.session_id, "probe for unknown session");
            return Ok(());
        };

        if session.role == SessionRole::Joint {
            return self.pair_probe(&probe).await;
        }

        if session.role.is_endpoint() {
            // Endpoints neither pair nor forward probes.
            return Ok(());
        }

        if session.is_ready() {
            let pattern = session.pattern(stream.id)?;
            pattern.write_msg(frame).await?;
        } else if let Some(mut entry) = self.sessions.get_mut(&probe.session_id) {
            // Hold the probe until the second leg attaches; it is flushed
            // to the pattern stream the moment the pair completes.
            debug!(session = %probe.session_id, "buffering probe until pair completes");
            entry.pending_probe = Some(PendingProbe {
                from_stream: stream.id,
                frame: frame.to_vec(),
            });
        }
        Ok(())
    }

    /// Joint-side probe pairing: first arrival is stored, second is
    /// compared. Matching rands complete the circuit on both legs;
    /// mismatched rands kill it.
    async fn pair_probe(&self, probe: &ProbeSignal) -> Result<()> {
        let stored = match self.probes.get(&probe.session_id) {
            Some(entry) => entry.clone(),
            None => {
                self.probes
                    .insert(probe.session_id.clone(), probe.rand.clone());
                return Ok(());
            }
        };

        if stored == probe.rand {
            debug!(session = %probe.session_id, "probes paired, circuit complete");
            let success = messages::new_success(&probe.session_id)?.encode()?;
            self.send_relay(&probe.session_id, &success).await?;
        } else {
            warn!(session = %probe.session_id, "probe mismatch, tearing circuit down");
            let _ = self.close_circuit(&probe.session_id).await;
        }
        Ok(())
    }

    async fn flush_pending_probe(&self, session_id: &SessionId) {
        let pending = self
            .sessions
            .get_mut(session_id)
            .and_then(|mut s| s.pending_probe.take());
        let Some(pending) = pending else { return };
        let pattern = match self
            .get_session(session_id)
            .map(|s| s.pattern(pending.from_stream))
        {
            Some(Ok(pattern)) => pattern,
            _ => return,
        };
        debug!(session = %session_id, "forwarding buffered probe");
        if let Err(e) = pattern.write_msg(&pending.frame).await {
            debug!("buffered probe forward failed: {e}");
        }
    }

    async fn handle_success(self: &Arc<Self>, relay: &Relay, stream: &RelayStream, frame: &[u8]) -> Result<()> {
        let msg: CircuitSuccess = whitenoise_transport::cbor::from_slice(&relay.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let session = self
            .get_session(&msg.session_id)
            .ok_or_else(|| ProtocolError::NoSuchSession(msg.session_id.clone()))?;

        match session.role {
            SessionRole::Caller | SessionRole::Answer => {
                let conn = self
                    .get_circuit(&msg.session_id)
                    .ok_or_else(|| ProtocolError::NoSuchSession(msg.session_id.clone()))?;
                conn.set_ready().await;
                info!(session = %msg.session_id, role = %session.role, "circuit ready");
                if session.role == SessionRole::Caller {
                    self.spawn_secure_caller(conn);
                } else {
                    self.spawn_secure_answer(conn);
                }
                Ok(())
            }
            _ => {
                if !session.is_ready() {
                    return Err(ProtocolError::SessionNotReady(msg.session_id));
                }
                let pattern = session.pattern(stream.id)?;
                pattern.write_msg(frame).await?;
                Ok(())
            }
        }
    }

    async fn handle_disconnect(&self, relay: &Relay, stream: &RelayStream, frame: &[u8]) -> Result<()> {
        let msg: Disconnect = whitenoise_transport::cbor::from_slice(&relay.data)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        info!(session = %msg.session_id, code = msg.err_code, "disconnect received");
        if !self.sessions.contains_key(&msg.session_id) {
            return Err(ProtocolError::NoSuchSession(msg.session_id));
        }

        // Forward onward (never back at the sender), then drop local state.
        let _ = self
            .forward_relay(&msg.session_id, frame, stream.remote_peer)
            .await;
        self.remove_session(&msg.session_id);
        Ok(())
    }

    // -- end-to-end secure sessions ---------------------------------------

    /// Start the initiator-side Noise handshake over a ready circuit.
    pub fn spawn_secure_caller(self: &Arc<Self>, conn: Arc<CircuitConn>) {
        if self.secures.contains_key(conn.session_id()) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = conn.session_id().clone();
            let Some(remote) = conn.remote_id() else {
                error!(session = %session_id, "caller circuit without remote identity");
                return;
            };
            let io: Arc<dyn CircuitIo> = conn;
            match secure_caller(io, manager.account(), remote).await {
                Ok(secure) => manager.install_secure(session_id, secure, SessionRole::Caller),
                Err(e) => {
                    error!(session = %session_id, "caller handshake failed: {e}");
                    let _ = manager.close_circuit(&session_id).await;
                }
            }
        });
    }

    /// Start the responder-side Noise handshake over a ready circuit.
    pub fn spawn_secure_answer(self: &Arc<Self>, conn: Arc<CircuitConn>) {
        if self.secures.contains_key(conn.session_id()) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = conn.session_id().clone();
            let io: Arc<dyn CircuitIo> = conn;
            match secure_answer(io, manager.account()).await {
                Ok(secure) => manager.install_secure(session_id, secure, SessionRole::Answer),
                Err(e) => {
                    error!(session = %session_id, "answer handshake failed: {e}");
                    let _ = manager.close_circuit(&session_id).await;
                }
            }
        });
    }

    fn install_secure(&self, session_id: SessionId, secure: SecureSession, role: SessionRole) {
        info!(session = %session_id, role = %role, remote = %secure.remote_id(), "secure session established");
        self.secures.insert(session_id.clone(), Arc::new(secure));
        let _ = self.events.send(NodeEvent::SecureConnEstablished { session_id, role });
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whitenoise_crypto::KeyType;
    use whitenoise_transport::mem::MemNetwork;
    use whitenoise_transport::FramedStream;

    fn manager(mode: ServiceMode) -> Arc<RelayManager> {
        let net = MemNetwork::new();
        let account = Account::from_seed(KeyType::Ed25519, [9u8; 32]).expect("seed");
        let host = net.host(account.peer_id());
        let acks = AckRegistry::new(host.clone() as Arc<dyn Host>);
        let (events, _) = broadcast::channel(16);
        RelayManager::new(host, mode, account, acks, events)
    }

    fn leg(peer: u8) -> RelayStream {
        let (a, _b) = tokio::io::duplex(1024);
        let (_reader, writer) = FramedStream::new(Box::new(a)).split();
        RelayStream::new(PeerId([peer; 32]), writer)
    }

    fn sid(name: &str) -> SessionId {
        SessionId::from(name)
    }

    #[tokio::test]
    async fn test_stream_binding_invariant() {
        // Every stream in a session's pair maps back to that session in
        // the stream table.
        let manager = manager(ServiceMode::Server);
        let session_id = sid("binding");

        let mut session = Session::new(session_id.clone(), SessionRole::Relay);
        for peer in [1u8, 2u8] {
            let stream = leg(peer);
            manager.add_stream(stream.clone());
            session.add_stream(stream.clone());
            manager.add_session(session.clone());
            manager.bind_stream_session(stream.id, &session_id);
        }

        let session = manager.get_session(&session_id).expect("session");
        assert!(session.is_ready());
        for stream in &session.pair {
            let info = manager.get_stream(stream.id).expect("stream info");
            assert_eq!(info.session_id.as_ref(), Some(&session_id));
        }
    }

    #[tokio::test]
    async fn test_remove_session_clears_streams() {
        let manager = manager(ServiceMode::Server);
        let session_id = sid("cleanup");

        let mut session = Session::new(session_id.clone(), SessionRole::Joint);
        let a = leg(1);
        let b = leg(2);
        manager.add_stream(a.clone());
        manager.add_stream(b.clone());
        session.add_stream(a.clone());
        session.add_stream(b.clone());
        manager.add_session(session);

        manager.remove_session(&session_id);
        assert!(!manager.has_session(&session_id));
        assert!(manager.get_stream(a.id).is_none());
        assert!(manager.get_stream(b.id).is_none());
    }

    #[tokio::test]
    async fn test_sessions_with_peer() {
        let manager = manager(ServiceMode::Server);
        let session_id = sid("per-peer");

        let stream = leg(7);
        manager.add_stream(stream.clone());
        let mut session = Session::new(session_id.clone(), SessionRole::Entry);
        session.add_stream(stream.clone());
        manager.add_session(session);
        manager.bind_stream_session(stream.id, &session_id);

        let found = manager.sessions_with_peer(PeerId([7u8; 32]));
        assert_eq!(found, vec![session_id]);
        assert!(manager.sessions_with_peer(PeerId([8u8; 32])).is_empty());
    }

    #[tokio::test]
    async fn test_send_relay_requires_session() {
        let manager = manager(ServiceMode::Server);
        let result = manager.send_relay(&sid("missing"), b"frame").await;
        assert!(matches!(result, Err(ProtocolError::NoSuchSession(_))));
    }

    #[tokio::test]
    async fn test_set_role() {
        let manager = manager(ServiceMode::Server);
        let session_id = sid("role-change");
        manager.add_session(Session::new(session_id.clone(), SessionRole::Entry));
        manager.set_role(&session_id, SessionRole::Exit);
        assert_eq!(
            manager.get_session(&session_id).expect("session").role,
            SessionRole::Exit
        );
    }
}
