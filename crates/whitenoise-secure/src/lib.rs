//! # whitenoise-secure
//!
//! The end-to-end secure channel layered over a circuit connection.
//!
//! A circuit delivers ordered reliable bytes between Caller and Answer, but
//! every hop on the path sees them. This crate runs a Noise `XX` handshake
//! (`25519_ChaChaPoly_SHA256`) over the circuit, authenticates both sides'
//! WhiteNoise identities through signed handshake payloads, and then frames
//! all application traffic as authenticated-encrypted records.
//!
//! - [`io`] - the [`CircuitIo`](io::CircuitIo) seam the session runs over,
//!   plus the u32-length-prefixed record framing
//! - [`handshake`] - the three-message XX exchange and identity checks
//! - [`session`] - [`SecureSession`](session::SecureSession) read/write

pub mod handshake;
pub mod io;
pub mod session;

pub use handshake::{secure_answer, secure_caller};
pub use io::CircuitIo;
pub use session::SecureSession;

/// Error types for the secure channel.
#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    /// The underlying circuit closed or timed out.
    #[error("circuit closed: {0}")]
    Closed(String),

    /// A record or handshake frame violated the framing rules.
    #[error("record framing error: {0}")]
    Framing(String),

    /// The Noise protocol state machine failed.
    #[error("noise error: {0}")]
    Noise(String),

    /// The remote handshake payload failed identity verification.
    #[error("identity verification failed: {0}")]
    Identity(String),

    /// Handshake message did not arrive within the read deadline.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// Payload encoding or decoding failed.
    #[error("payload error: {0}")]
    Payload(String),
}

impl From<snow::Error> for SecureError {
    fn from(e: snow::Error) -> Self {
        SecureError::Noise(e.to_string())
    }
}

/// Result type alias for secure channel operations.
pub type Result<T> = std::result::Result<T, SecureError>;
