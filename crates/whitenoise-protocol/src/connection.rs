//! The endpoint-side circuit connection.
//!
//! At Caller and Answer the circuit terminates into a `CircuitConn`:
//! inbound Data payloads land in its buffer, outbound writes leave as
//! Data relay messages on the session's single leg. Reads block on an
//! empty buffer until data arrives, the connection closes, or the read
//! timeout (5 minutes) fires. The Noise layer runs directly over this
//! connection via [`CircuitIo`].

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use whitenoise_crypto::WhiteNoiseID;
use whitenoise_secure::{CircuitIo, SecureError};
use whitenoise_transport::messages;
use whitenoise_types::{SessionId, CIRCUIT_READ_TIMEOUT};

use crate::relay::RelayManager;
use crate::{ProtocolError, Result};

/// Construction state of the endpoint connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Ready,
}

/// Payload bytes per Data message, leaving the envelope comfortable room
/// inside the 64 KiB outer frame.
const DATA_CHUNK_LENGTH: usize = 32 * 1024;

/// Byte-oriented connection presented to the secure layer at Caller and
/// Answer.
pub struct CircuitConn {
    session_id: SessionId,
    local_id: WhiteNoiseID,
    /// Known up front on the caller (the dialed identity); learned from the
    /// handshake on the answer.
    remote_id: Option<WhiteNoiseID>,
    relay: Weak<RelayManager>,
    state: Mutex<CircuitState>,
    buffer: Mutex<BytesMut>,
    readable: Notify,
    closed: CancellationToken,
    read_timeout: Duration,
}

impl CircuitConn {
    pub(crate) fn new(
        relay: Weak<RelayManager>,
        session_id: SessionId,
        local_id: WhiteNoiseID,
        remote_id: Option<WhiteNoiseID>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            local_id,
            remote_id,
            relay,
            state: Mutex::new(CircuitState::Building),
            buffer: Mutex::new(BytesMut::new()),
            readable: Notify::new(),
            closed: CancellationToken::new(),
            read_timeout: CIRCUIT_READ_TIMEOUT,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local_id(&self) -> WhiteNoiseID {
        self.local_id
    }

    pub fn remote_id(&self) -> Option<WhiteNoiseID> {
        self.remote_id
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.lock().await
    }

    /// Flip to Ready; called when the CircuitSuccess signal arrives.
    pub async fn set_ready(&self) {
        *self.state.lock().await = CircuitState::Ready;
    }

    /// Append relayed bytes and wake a blocked reader.
    pub async fn inbound(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(bytes);
        drop(buffer);
        self.readable.notify_one();
    }

    /// Consume buffered bytes; on empty, wait for the next `inbound` with
    /// the read timeout.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.is_cancelled() {
                return Err(ProtocolError::Rejected("circuit connection closed".into()));
            }

            // Arm the wakeup before the emptiness check so an `inbound`
            // racing between the two is not lost.
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut buffer = self.buffer.lock().await;
                if !buffer.is_empty() {
                    let n = buffer.len().min(buf.len());
                    buf[..n].copy_from_slice(&buffer[..n]);
                    buffer.advance(n);
                    return Ok(n);
                }
            }

            tokio::select! {
                _ = &mut readable => {}
                _ = self.closed.cancelled() => {
                    return Err(ProtocolError::Rejected("circuit connection closed".into()));
                }
                _ = tokio::time::sleep(self.read_timeout) => {
                    return Err(ProtocolError::Timeout);
                }
            }
        }
    }

    /// Submit `data` to the session's pair as Data relay messages. The
    /// circuit carries a byte stream, so large buffers split across
    /// multiple messages; each wrapped message must still fit the outer
    /// u16 frame. Returns the plaintext byte count.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let relay = self
            .relay
            .upgrade()
            .ok_or_else(|| ProtocolError::Rejected("relay manager gone".into()))?;
        for chunk in data.chunks(DATA_CHUNK_LENGTH) {
            let msg = messages::new_data(&self.session_id, chunk)?;
            relay.send_relay(&self.session_id, &msg.encode()?).await?;
        }
        Ok(data.len())
    }

    /// Cancel the connection; blocked readers observe an error and the
    /// secure layer unwinds.
    pub fn close(&self) {
        debug!(session = %self.session_id, "circuit connection closed");
        self.closed.cancel();
        self.readable.notify_waiters();
    }
}

#[async_trait::async_trait]
impl CircuitIo for CircuitConn {
    async fn read(&self, buf: &mut [u8]) -> whitenoise_secure::Result<usize> {
        CircuitConn::read(self, buf)
            .await
            .map_err(|e| SecureError::Closed(e.to_string()))
    }

    async fn write_all(&self, buf: &[u8]) -> whitenoise_secure::Result<()> {
        CircuitConn::write(self, buf)
            .await
            .map(|_| ())
            .map_err(|e| SecureError::Closed(e.to_string()))
    }

    async fn close(&self) {
        CircuitConn::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Arc<CircuitConn> {
        let local = whitenoise_crypto::Account::generate().whitenoise_id();
        CircuitConn::new(Weak::new(), SessionId::from("sid"), local, None)
    }

    #[tokio::test]
    async fn test_inbound_wakes_reader() {
        let c = conn();
        let reader = Arc::clone(&c);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = reader.read(&mut buf).await.expect("read");
            buf[..n].to_vec()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        c.inbound(b"hello").await;
        assert_eq!(task.await.expect("join"), b"hello");
    }

    #[tokio::test]
    async fn test_partial_consume() {
        let c = conn();
        c.inbound(b"abcdef").await;

        let mut buf = [0u8; 4];
        let n = c.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"abcd");
        let n = c.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_close_releases_blocked_reader() {
        let c = conn();
        let reader = Arc::clone(&c);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        c.close();
        assert!(task.await.expect("join").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let c = conn();
        let mut buf = [0u8; 4];
        let result = c.read(&mut buf).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let c = conn();
        assert_eq!(c.state().await, CircuitState::Building);
        c.set_ready().await;
        assert_eq!(c.state().await, CircuitState::Ready);
    }
}
