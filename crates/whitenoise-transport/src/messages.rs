//! The WhiteNoise wire message set.
//!
//! Four protocols run over the host's framed streams:
//!
//! | Protocol | Messages |
//! |---|---|
//! | `/relay` | [`Relay`] envelopes: Wake, SetSessionId, Data, Probe, Success, Disconnect |
//! | `/cmd`   | [`Command`] envelopes: SessionExpand |
//! | `/ack`   | [`Ack`] |
//! | `/proxy` | [`Request`] envelopes: NewProxy, NewCircuit, MainNetPeers, DecryptGossip, NegPlaintext, UnRegister |
//!
//! Envelopes carry their payload pre-encoded in a `data` field so that
//! forwarding hops can pass frames through without re-encoding. Message ids
//! are the base58 SHA-256 of the envelope encoded with an empty id, which
//! also serves as the pubsub dedup key for gossiped payloads.

use serde::{Deserialize, Serialize};
use whitenoise_crypto::hash::{sha256, sha256_b58};
use whitenoise_types::{NodeInfo, PeerId, SessionId, SessionRole};

use crate::cbor;
use crate::Result;

// ---------------------------------------------------------------------------
// /relay
// ---------------------------------------------------------------------------

/// Discriminant of a relay envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    /// First message on a fresh relay stream; no-op beyond admission.
    Wake,
    /// Bind the stream to a session on the receiver. Ack-replied.
    SetSessionId,
    /// Circuit payload, forwarded hop by hop.
    Data,
    /// Joint liveness probe.
    Probe,
    /// Circuit completion signal, emitted by the joint.
    Success,
    /// Circuit teardown signal.
    Disconnect,
    /// Reserved; acks travel on `/ack` streams.
    Ack,
}

/// Envelope for every `/relay` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Message id: base58 SHA-256 of this envelope with `id` empty.
    pub id: String,
    pub kind: RelayKind,
    /// Encoded payload; empty for Wake.
    pub data: Vec<u8>,
}

/// Payload of [`RelayKind::SetSessionId`]. `role` is the role of the
/// *receiving* end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetSessionIdMsg {
    pub session_id: SessionId,
    pub role: SessionRole,
}

/// Payload of [`RelayKind::Data`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayMsg {
    pub session_id: SessionId,
    pub data: Vec<u8>,
}

/// Payload of [`RelayKind::Probe`]: `rand = SHA-256(session_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeSignal {
    pub session_id: SessionId,
    pub rand: Vec<u8>,
}

/// Payload of [`RelayKind::Success`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitSuccess {
    pub session_id: SessionId,
}

/// Payload of [`RelayKind::Disconnect`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {
    pub session_id: SessionId,
    pub err_code: u32,
}

impl Relay {
    fn with_derived_id(kind: RelayKind, data: Vec<u8>) -> Result<Self> {
        let mut relay = Relay {
            id: String::new(),
            kind,
            data,
        };
        relay.id = derive_msg_id(&relay)?;
        Ok(relay)
    }

    /// Encode for framing.
    pub fn encode(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self)
    }

    /// Decode a framed body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice(bytes)
    }
}

/// Stream-admission wake message.
pub fn new_wake() -> Result<Relay> {
    Relay::with_derived_id(RelayKind::Wake, Vec::new())
}

/// SetSessionId binding `session_id` with the receiver acting as
/// `other_role`.
pub fn new_set_session(session_id: &SessionId, other_role: SessionRole) -> Result<Relay> {
    let payload = cbor::to_vec(&SetSessionIdMsg {
        session_id: session_id.clone(),
        role: other_role,
    })?;
    Relay::with_derived_id(RelayKind::SetSessionId, payload)
}

/// Circuit payload carrying `data`.
pub fn new_data(session_id: &SessionId, data: &[u8]) -> Result<Relay> {
    let payload = cbor::to_vec(&RelayMsg {
        session_id: session_id.clone(),
        data: data.to_vec(),
    })?;
    Relay::with_derived_id(RelayKind::Data, payload)
}

/// Probe signal whose rand is the SHA-256 of the session id.
pub fn new_probe(session_id: &SessionId) -> Result<Relay> {
    let rand = sha256(session_id.as_str().as_bytes());
    let payload = cbor::to_vec(&ProbeSignal {
        session_id: session_id.clone(),
        rand: rand.to_vec(),
    })?;
    Relay::with_derived_id(RelayKind::Probe, payload)
}

/// Circuit completion signal.
pub fn new_success(session_id: &SessionId) -> Result<Relay> {
    let payload = cbor::to_vec(&CircuitSuccess {
        session_id: session_id.clone(),
    })?;
    Relay::with_derived_id(RelayKind::Success, payload)
}

/// Circuit teardown signal.
pub fn new_disconnect(session_id: &SessionId) -> Result<Relay> {
    let payload = cbor::to_vec(&Disconnect {
        session_id: session_id.clone(),
        err_code: 0,
    })?;
    Relay::with_derived_id(RelayKind::Disconnect, payload)
}

// ---------------------------------------------------------------------------
// /cmd
// ---------------------------------------------------------------------------

/// Discriminant of a command envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SessionExpand,
}

/// Envelope for every `/cmd` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub kind: CommandKind,
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Ask a relay candidate to extend `session_id` to `peer_id` (the joint).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionExpand {
    pub session_id: SessionId,
    pub peer_id: PeerId,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice(bytes)
    }
}

/// Build a SessionExpand command with a derived id.
pub fn new_session_expand(
    from: PeerId,
    session_id: &SessionId,
    joint: PeerId,
) -> Result<Command> {
    let payload = cbor::to_vec(&SessionExpand {
        session_id: session_id.clone(),
        peer_id: joint,
    })?;
    let mut cmd = Command {
        command_id: String::new(),
        kind: CommandKind::SessionExpand,
        from,
        data: payload,
    };
    cmd.command_id = derive_msg_id(&cmd)?;
    Ok(cmd)
}

// ---------------------------------------------------------------------------
// /ack
// ---------------------------------------------------------------------------

/// One-shot reply correlated to a request id. `result == false` carries a
/// human-readable reason in `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command_id: String,
    pub result: bool,
    pub data: Vec<u8>,
}

impl Ack {
    /// A negative ack with a reason.
    pub fn reject(command_id: &str, reason: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            result: false,
            data: reason.as_bytes().to_vec(),
        }
    }

    /// A positive ack with an optional payload.
    pub fn accept(command_id: &str, data: Vec<u8>) -> Self {
        Self {
            command_id: command_id.to_string(),
            result: true,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// /proxy
// ---------------------------------------------------------------------------

/// Discriminant of a proxy request envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    NewProxy,
    NewCircuit,
    MainNetPeers,
    DecryptGossip,
    NegPlaintext,
    UnRegister,
}

/// Envelope for every `/proxy` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub req_id: String,
    pub from: PeerId,
    pub kind: RequestKind,
    pub data: Vec<u8>,
}

/// Register the caller as a hosted client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewProxy {
    /// String form of the client's WhiteNoiseID.
    pub whitenoise_id: String,
    /// Requested lease in seconds.
    pub lease_secs: u64,
}

/// Ask the entry proxy to build a circuit toward `to`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCircuit {
    /// Destination mask of the registered caller.
    pub from: String,
    /// Destination mask of the answer.
    pub to: String,
    pub session_id: SessionId,
}

/// Ask a bootstrap node for peer listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MainNetPeers {
    pub max: u32,
}

/// Peer listing reply, carried in the ack payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeersList {
    pub peers: Vec<NodeInfo>,
}

/// Proxy-to-client: decrypt a gossiped negotiation ciphertext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptGossip {
    pub destination: String,
    pub cipher: Vec<u8>,
}

/// Proxy-to-client: encrypt a negotiation record for the dialed
/// destination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegPlaintext {
    pub session_id: SessionId,
    pub neg: Vec<u8>,
}

/// Evict the caller and all its circuits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnRegister {
    pub whitenoise_id: String,
}

impl Request {
    /// Build a request envelope with a derived id.
    pub fn new<T: Serialize>(from: PeerId, kind: RequestKind, payload: &T) -> Result<Self> {
        let data = cbor::to_vec(payload)?;
        let mut req = Request {
            req_id: String::new(),
            from,
            kind,
            data,
        };
        req.req_id = derive_msg_id(&req)?;
        Ok(req)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Gossip & handshake payloads
// ---------------------------------------------------------------------------

/// The circuit negotiation record, ECIES-sealed to the answer before
/// gossiping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Negotiate {
    /// The joint node the exit side must reach through its relay.
    pub join: PeerId,
    pub session_id: SessionId,
    /// Destination mask, echoed for validation.
    pub destination: String,
    pub sig: Vec<u8>,
}

/// The gossiped form: destination mask plus sealed [`Negotiate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedNeg {
    pub destination: String,
    pub cipher: Vec<u8>,
}

/// Identity payload exchanged inside the Noise-XX handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseHandshakePayload {
    /// String form of the sender's WhiteNoiseID.
    pub identity_key: String,
    /// Identity signature over the Noise static public key.
    pub identity_sig: Vec<u8>,
}

/// Derive a message id: base58 SHA-256 of the value's encoding. Callers
/// pass the envelope with its id field still empty.
pub fn derive_msg_id<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_b58(&cbor::to_vec(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::from("5KJt9qXzn")
    }

    #[test]
    fn test_relay_encode_decode_all_kinds() {
        let msgs = [
            new_wake().expect("wake"),
            new_set_session(&sid(), SessionRole::Joint).expect("set"),
            new_data(&sid(), b"payload").expect("data"),
            new_probe(&sid()).expect("probe"),
            new_success(&sid()).expect("success"),
            new_disconnect(&sid()).expect("disconnect"),
        ];
        for msg in msgs {
            let bytes = msg.encode().expect("encode");
            let restored = Relay::decode(&bytes).expect("decode");
            assert_eq!(msg, restored);
        }
    }

    #[test]
    fn test_msg_ids_differ_by_content() {
        let a = new_data(&sid(), b"one").expect("data");
        let b = new_data(&sid(), b"two").expect("data");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_probe_rand_is_session_digest() {
        let probe = new_probe(&sid()).expect("probe");
        let signal: ProbeSignal = cbor::from_slice(&probe.data).expect("payload");
        assert_eq!(signal.rand, sha256(sid().as_str().as_bytes()).to_vec());
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = new_session_expand(PeerId([1u8; 32]), &sid(), PeerId([2u8; 32]))
            .expect("command");
        let restored = Command::decode(&cmd.encode().expect("encode")).expect("decode");
        assert_eq!(cmd, restored);
        assert!(!cmd.command_id.is_empty());
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request::new(
            PeerId([3u8; 32]),
            RequestKind::NewCircuit,
            &NewCircuit {
                from: "abc".into(),
                to: "def".into(),
                session_id: sid(),
            },
        )
        .expect("request");
        let restored = Request::decode(&req.encode().expect("encode")).expect("decode");
        assert_eq!(req, restored);
    }

    #[test]
    fn test_ack_reject_carries_reason() {
        let ack = Ack::reject("id-1", "no such session");
        let restored = Ack::decode(&ack.encode().expect("encode")).expect("decode");
        assert!(!restored.result);
        assert_eq!(restored.data, b"no such session");
    }

    #[test]
    fn test_negotiate_roundtrip() {
        let neg = Negotiate {
            join: PeerId([9u8; 32]),
            session_id: sid(),
            destination: "mask".into(),
            sig: vec![1, 2, 3],
        };
        let bytes = cbor::to_vec(&neg).expect("encode");
        let restored: Negotiate = cbor::from_slice(&bytes).expect("decode");
        assert_eq!(neg, restored);
    }
}
