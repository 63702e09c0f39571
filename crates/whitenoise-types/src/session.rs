//! Session and stream identifiers, circuit roles, and node modes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The role one node plays for one session of a circuit.
///
/// A full circuit chains `Caller → Entry → Joint → Relay → Exit → Answer`.
/// Endpoint roles (Caller, Answer) hold a single stream; forwarding roles
/// hold two, one per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionRole {
    Caller = 1,
    Entry = 2,
    Joint = 3,
    Relay = 4,
    Exit = 5,
    Answer = 6,
}

impl SessionRole {
    /// Whether this role terminates circuit traffic into an application
    /// connection rather than forwarding it.
    pub fn is_endpoint(&self) -> bool {
        matches!(self, SessionRole::Caller | SessionRole::Answer)
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionRole::Caller => "caller",
            SessionRole::Entry => "entry",
            SessionRole::Joint => "joint",
            SessionRole::Relay => "relay",
            SessionRole::Exit => "exit",
            SessionRole::Answer => "answer",
        };
        f.write_str(name)
    }
}

/// Base58-encoded 32-byte session identifier, generated by the caller.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an already-encoded identifier.
    pub fn new(encoded: String) -> Self {
        Self(encoded)
    }

    /// The encoded string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Process-local identifier of one stream leg. Never crosses the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl StreamId {
    /// Allocate the next process-unique stream id.
    pub fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node configuration chosen at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Full role: can serve as Entry, Joint, Relay, or Exit.
    Server,
    /// Endpoint only: not a relay candidate, rejects non-Answer sessions.
    Client,
    /// Peer directory service only; no relay stream handlers.
    Boot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_endpoint_classification() {
        assert!(SessionRole::Caller.is_endpoint());
        assert!(SessionRole::Answer.is_endpoint());
        assert!(!SessionRole::Entry.is_endpoint());
        assert!(!SessionRole::Joint.is_endpoint());
        assert!(!SessionRole::Relay.is_endpoint());
        assert!(!SessionRole::Exit.is_endpoint());
    }

    #[test]
    fn test_stream_ids_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_display() {
        let sid = SessionId::from("9aBcD");
        assert_eq!(sid.to_string(), "9aBcD");
        assert_eq!(sid.as_str(), "9aBcD");
    }
}
