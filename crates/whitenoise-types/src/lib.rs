//! # whitenoise-types
//!
//! Shared domain types for the WhiteNoise overlay: peer and session
//! identifiers, circuit roles, node modes, and the protocol timing
//! constants used by every subsystem.

pub mod peer;
pub mod session;

use std::time::Duration;

pub use peer::{NodeInfo, PeerId};
pub use session::{ServiceMode, SessionId, SessionRole, StreamId};

/// Ack deadline for a SetSessionId exchange.
pub const SET_SESSION_TIMEOUT: Duration = Duration::from_secs(1);

/// Ack deadline for a SessionExpand command.
pub const EXPAND_SESSION_TIMEOUT: Duration = Duration::from_secs(3);

/// Ack deadline for proxy registration.
pub const REGISTER_PROXY_TIMEOUT: Duration = Duration::from_secs(1);

/// Ack deadline for a NewCircuit request.
pub const NEW_CIRCUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ack deadline for client-side encrypt/decrypt of negotiation payloads.
pub const DECRYPT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-message deadline while reading handshake frames over a circuit.
pub const READ_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Ack deadline for a MainNetPeers listing request.
pub const MAINNET_PEERS_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a blocked circuit read waits for inbound data.
pub const CIRCUIT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a dial waits for the end-to-end secure session to come up.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for cross-component request/reply calls.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(1);

/// Default lease granted to a registered proxy client.
pub const PROXY_LEASE: Duration = Duration::from_secs(3600);

/// Candidate retries when picking a joint or relay node.
pub const RETRY_TIMES: usize = 3;

/// Upper bound on peer listings fetched from the peer directory.
pub const DIRECTORY_PEERS_MAX: usize = 100;
