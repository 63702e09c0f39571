//! # whitenoise-protocol
//!
//! The circuit construction and relay core. One five-hop circuit is built
//! by four cooperating subsystems, each with its own module:
//!
//! - [`ack`] - request-id-correlated one-shot completions across all
//!   protocols
//! - [`session`] - session and stream bookkeeping: which streams form
//!   which hop of which circuit
//! - [`relay`] - the per-stream `/relay` dispatcher: session binding, data
//!   forwarding, probe pairing at the joint, success and disconnect
//!   propagation
//! - [`connection`] - the endpoint-side byte connection circuits terminate
//!   into
//! - [`command`] - the `/cmd` SessionExpand exchange extending a session
//!   past the joint
//! - [`proxy`] - the `/proxy` request surface: client registration, circuit
//!   requests, client-side encrypt/decrypt, peer listings
//! - [`consumer`] - the gossip consumer driving the exit-side half of a
//!   circuit build
//! - [`service`] - assembly: wires the managers to a host and exposes the
//!   caller-side operations

pub mod ack;
pub mod command;
pub mod connection;
pub mod consumer;
pub mod proxy;
pub mod relay;
pub mod service;
pub mod session;

pub use service::NoiseService;

use whitenoise_types::{SessionId, SessionRole, StreamId};

/// Error types for circuit operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A bounded wait elapsed without a reply.
    #[error("timeout")]
    Timeout,

    /// The remote refused the request; the reason is surfaced verbatim.
    #[error("rejected: {0}")]
    Rejected(String),

    /// No session with this id.
    #[error("no such session {0}")]
    NoSuchSession(SessionId),

    /// No stream with this id.
    #[error("no such stream {0}")]
    NoSuchStream(StreamId),

    /// The session's stream pair is incomplete.
    #[error("session {0} not ready")]
    SessionNotReady(SessionId),

    /// A payload failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// A cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] whitenoise_crypto::CryptoError),

    /// The transport layer failed.
    #[error(transparent)]
    Transport(#[from] whitenoise_transport::TransportError),

    /// The end-to-end secure layer failed.
    #[error(transparent)]
    Secure(#[from] whitenoise_secure::SecureError),

    /// The gossip bus failed.
    #[error(transparent)]
    Gossip(#[from] whitenoise_gossip::GossipError),

    /// The operation requires a registered proxy.
    #[error("not registered with a proxy")]
    Unregistered,

    /// The registration or session already exists.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// No viable candidate after all retries.
    #[error("no candidate: {0}")]
    Exhausted(String),
}

/// Result type alias for circuit operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Asynchronous circuit lifecycle notifications.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// An end-to-end secure session completed on this endpoint.
    SecureConnEstablished {
        session_id: SessionId,
        role: SessionRole,
    },
    /// A circuit was torn down and its session removed.
    CircuitClosed { session_id: SessionId },
}
