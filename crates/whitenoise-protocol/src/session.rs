//! Session and stream bookkeeping.
//!
//! A session is one hop's slot of state for one circuit: up to two stream
//! legs, ordered, plus the role this node plays between them. Endpoint
//! roles hold one leg; forwarding roles hold two and shuttle frames
//! between them.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use whitenoise_transport::framing::FramedWriter;
use whitenoise_types::{PeerId, SessionId, SessionRole, StreamId};

use crate::{ProtocolError, Result};

/// One stream leg: a cloneable handle over the write half of a relay
/// stream. The read half lives in the stream's inbound task; cancelling
/// the token terminates it.
#[derive(Clone)]
pub struct RelayStream {
    pub id: StreamId,
    pub remote_peer: PeerId,
    writer: Arc<Mutex<FramedWriter>>,
    cancel: CancellationToken,
}

impl RelayStream {
    pub fn new(remote_peer: PeerId, writer: FramedWriter) -> Self {
        Self {
            id: StreamId::next(),
            remote_peer,
            writer: Arc::new(Mutex::new(writer)),
            cancel: CancellationToken::new(),
        }
    }

    /// Write one frame to the remote end.
    pub async fn write_msg(&self, frame: &[u8]) -> Result<()> {
        self.writer
            .lock()
            .await
            .write_msg(frame)
            .await
            .map_err(ProtocolError::from)
    }

    /// Cancel the stream; its inbound task observes this and exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// The cancellation handle the inbound task selects on.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

/// A probe held back because the pair was incomplete when it arrived.
#[derive(Clone, Debug)]
pub struct PendingProbe {
    /// The leg the probe arrived on; it is forwarded to that leg's pattern.
    pub from_stream: StreamId,
    /// The raw relay frame, forwarded verbatim.
    pub frame: Vec<u8>,
}

/// One hop's state for one circuit.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    /// Ordered stream pair; `len == 2` means the hop is wired through.
    pub pair: Vec<RelayStream>,
    pub role: SessionRole,
    /// Probe buffered until the second leg attaches.
    pub pending_probe: Option<PendingProbe>,
}

impl Session {
    pub fn new(id: SessionId, role: SessionRole) -> Self {
        Self {
            id,
            pair: Vec::new(),
            role,
            pending_probe: None,
        }
    }

    /// Append a stream leg. A third arrival slides the window: the oldest
    /// leg is dropped. (The degenerate entry-acts-as-relay topology reaches
    /// this.)
    pub fn add_stream(&mut self, stream: RelayStream) {
        self.pair.push(stream);
        while self.pair.len() > 2 {
            self.pair.remove(0);
        }
    }

    /// Whether both legs are attached.
    pub fn is_ready(&self) -> bool {
        self.pair.len() == 2
    }

    /// Whether `stream_id` is one of this session's legs.
    pub fn has(&self, stream_id: StreamId) -> bool {
        self.pair.iter().any(|s| s.id == stream_id)
    }

    /// The other leg of the pair: forwarding never reflects a message back
    /// on the stream it arrived on.
    pub fn pattern(&self, stream_id: StreamId) -> Result<RelayStream> {
        if self.pair.len() != 2 {
            return Err(ProtocolError::SessionNotReady(self.id.clone()));
        }
        for (i, stream) in self.pair.iter().enumerate() {
            if stream.id == stream_id {
                return Ok(self.pair[i ^ 1].clone());
            }
        }
        Err(ProtocolError::NoSuchStream(stream_id))
    }
}

/// A stream's registry entry: the handle plus the session it is bound to,
/// if any.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub stream: RelayStream,
    pub session_id: Option<SessionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use whitenoise_transport::FramedStream;

    fn stream(peer: u8) -> RelayStream {
        let (a, _b) = tokio::io::duplex(1024);
        let (_reader, writer) = FramedStream::new(Box::new(a)).split();
        RelayStream::new(PeerId([peer; 32]), writer)
    }

    fn sid() -> SessionId {
        SessionId::from("test-session")
    }

    #[test]
    fn test_pair_bounds() {
        let mut sess = Session::new(sid(), SessionRole::Joint);
        assert!(!sess.is_ready());

        sess.add_stream(stream(1));
        assert!(!sess.is_ready());

        sess.add_stream(stream(2));
        assert!(sess.is_ready());
        assert!(sess.pair.len() <= 2);
    }

    #[test]
    fn test_third_stream_slides_window() {
        let mut sess = Session::new(sid(), SessionRole::Entry);
        let first = stream(1);
        let first_id = first.id;
        sess.add_stream(first);
        sess.add_stream(stream(2));
        sess.add_stream(stream(3));

        assert_eq!(sess.pair.len(), 2);
        assert!(!sess.has(first_id));
    }

    #[test]
    fn test_pattern_returns_other_leg() {
        let mut sess = Session::new(sid(), SessionRole::Relay);
        let a = stream(1);
        let b = stream(2);
        let (a_id, b_id) = (a.id, b.id);
        sess.add_stream(a);
        sess.add_stream(b);

        assert_eq!(sess.pattern(a_id).expect("pattern").id, b_id);
        assert_eq!(sess.pattern(b_id).expect("pattern").id, a_id);
    }

    #[test]
    fn test_pattern_requires_ready_pair() {
        let mut sess = Session::new(sid(), SessionRole::Relay);
        let a = stream(1);
        let a_id = a.id;
        sess.add_stream(a);
        assert!(matches!(
            sess.pattern(a_id),
            Err(ProtocolError::SessionNotReady(_))
        ));
    }

    #[test]
    fn test_pattern_unknown_stream() {
        let mut sess = Session::new(sid(), SessionRole::Relay);
        sess.add_stream(stream(1));
        sess.add_stream(stream(2));
        assert!(matches!(
            sess.pattern(StreamId(999_999)),
            Err(ProtocolError::NoSuchStream(_))
        ));
    }
}
