//! # whitenoise-transport
//!
//! Point-to-point plumbing for the WhiteNoise overlay:
//!
//! - [`framing`] - length-prefixed message framing over ordered byte streams
//! - [`cbor`] - CBOR serialization helpers for the wire message set
//! - [`messages`] - every message that crosses a `/relay`, `/cmd`, `/ack`,
//!   or `/proxy` stream, plus message-id derivation
//! - [`host`] - the [`Host`](host::Host) abstraction: authenticated streams
//!   to remote peers, keyed by protocol
//! - [`mem`] - an in-process mesh host used by the test suite and demos
//! - [`quic`] - the production host over QUIC/TLS 1.3 (quinn)

pub mod cbor;
pub mod framing;
pub mod host;
pub mod mem;
pub mod messages;
pub mod quic;

pub use framing::{FramedReader, FramedStream, FramedWriter};
pub use host::{Host, IncomingStream, Protocol};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A frame violated the length-prefix format.
    #[error("framing error: {0}")]
    Framing(String),

    /// The remote peer does not serve the requested protocol.
    #[error("protocol {0} not supported by remote")]
    ProtocolUnsupported(String),

    /// No route to the requested peer.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// The peer is not admitted by the local allowlist.
    #[error("peer {0} not in allowlist")]
    NotAllowed(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection establishment or stream error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
