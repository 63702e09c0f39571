//! Post-handshake authenticated-encrypted record I/O.
//!
//! Records are `u32-be length ‖ noise ciphertext`. One Noise message holds
//! at most 65535 bytes, of which 16 are the Poly1305 tag, so writers chunk
//! plaintext at 65519 bytes. Reads and writes are independently locked:
//! the stateless transport keeps a nonce counter per direction, so a
//! blocked reader never stalls a writer.

use std::sync::Arc;

use snow::StatelessTransportState;
use tokio::sync::Mutex;
use whitenoise_crypto::WhiteNoiseID;

use crate::io::{read_frame, write_frame, CircuitIo};
use crate::Result;

/// Largest Noise message, ciphertext including tag.
pub const MAX_NOISE_MESSAGE_LENGTH: usize = 65535;

/// Poly1305 tag appended to every record.
pub const TAG_LENGTH: usize = 16;

/// Largest plaintext chunk per record.
pub const MAX_PLAINTEXT_LENGTH: usize = MAX_NOISE_MESSAGE_LENGTH - TAG_LENGTH;

struct ReadState {
    /// Decrypted bytes not yet consumed by the application.
    queued: Vec<u8>,
    seek: usize,
    nonce: u64,
}

/// An established end-to-end secure channel between Caller and Answer.
pub struct SecureSession {
    io: Arc<dyn CircuitIo>,
    transport: StatelessTransportState,
    local_id: WhiteNoiseID,
    remote_id: WhiteNoiseID,
    read_state: Mutex<ReadState>,
    write_nonce: Mutex<u64>,
}

impl SecureSession {
    pub(crate) fn new(
        io: Arc<dyn CircuitIo>,
        transport: StatelessTransportState,
        local_id: WhiteNoiseID,
        remote_id: WhiteNoiseID,
    ) -> Self {
        Self {
            io,
            transport,
            local_id,
            remote_id,
            read_state: Mutex::new(ReadState {
                queued: Vec::new(),
                seek: 0,
                nonce: 0,
            }),
            write_nonce: Mutex::new(0),
        }
    }

    /// This side's identity.
    pub fn local_id(&self) -> WhiteNoiseID {
        self.local_id
    }

    /// The authenticated remote identity.
    pub fn remote_id(&self) -> WhiteNoiseID {
        self.remote_id
    }

    /// Read decrypted bytes into `buf`, returning the count. Blocks until a
    /// record arrives; leftover plaintext is queued for the next call.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.read_state.lock().await;

        if state.seek < state.queued.len() {
            let n = copy_queued(&mut state, buf);
            return Ok(n);
        }

        let record = read_frame(self.io.as_ref(), MAX_NOISE_MESSAGE_LENGTH).await?;
        let mut plain = vec![0u8; record.len()];
        let nonce = state.nonce;
        let len = self.transport.read_message(nonce, &record, &mut plain)?;
        state.nonce += 1;
        plain.truncate(len);

        state.queued = plain;
        state.seek = 0;
        Ok(copy_queued(&mut state, buf))
    }

    /// Encrypt and send `data`, chunking into records as needed. Returns
    /// the plaintext byte count. An empty write sends nothing.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut nonce = self.write_nonce.lock().await;
        let mut out = vec![0u8; MAX_NOISE_MESSAGE_LENGTH];

        for chunk in data.chunks(MAX_PLAINTEXT_LENGTH) {
            let len = self.transport.write_message(*nonce, chunk, &mut out)?;
            *nonce += 1;
            write_frame(self.io.as_ref(), &out[..len]).await?;
        }
        Ok(data.len())
    }

    /// Close the underlying circuit, releasing blocked readers.
    pub async fn close(&self) {
        self.io.close().await;
    }
}

fn copy_queued(state: &mut ReadState, buf: &mut [u8]) -> usize {
    let available = &state.queued[state.seek..];
    let n = available.len().min(buf.len());
    buf[..n].copy_from_slice(&available[..n]);
    state.seek += n;
    if state.seek == state.queued.len() {
        state.queued.clear();
        state.seek = 0;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{secure_answer, secure_caller};
    use crate::io::StreamIo;
    use whitenoise_crypto::{Account, KeyType};

    async fn session_pair() -> (SecureSession, SecureSession) {
        let caller_acc = Account::from_seed(KeyType::Ed25519, [11u8; 32]).expect("seed");
        let answer_acc = Account::from_seed(KeyType::Ed25519, [22u8; 32]).expect("seed");
        let (a, b) = tokio::io::duplex(256 * 1024);
        let caller_io = StreamIo::new(a);
        let answer_io = StreamIo::new(b);

        let answer_id = answer_acc.whitenoise_id();
        let caller = tokio::spawn(async move {
            secure_caller(caller_io, &caller_acc, answer_id).await
        });
        let answer = tokio::spawn(async move { secure_answer(answer_io, &answer_acc).await });

        (
            caller.await.expect("join").expect("caller"),
            answer.await.expect("join").expect("answer"),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_both_directions() {
        let (caller, answer) = session_pair().await;

        caller.write(b"ping").await.expect("write");
        let mut buf = [0u8; 16];
        let n = answer.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"ping");

        answer.write(b"pong").await.expect("write");
        let n = caller.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_partial_reads_drain_queue() {
        let (caller, answer) = session_pair().await;
        caller.write(b"abcdefgh").await.expect("write");

        let mut buf = [0u8; 3];
        let mut collected = Vec::new();
        while collected.len() < 8 {
            let n = answer.read(&mut buf).await.expect("read");
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_large_write_chunks_into_records() {
        let (caller, answer) = session_pair().await;
        let payload: Vec<u8> = (0..MAX_PLAINTEXT_LENGTH + 1000)
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let n = caller.write(&payload).await.expect("write");
            assert_eq!(n, payload.len());
        });

        let mut collected = Vec::new();
        let mut buf = vec![0u8; 8192];
        while collected.len() < expected.len() {
            let n = answer.read(&mut buf).await.expect("read");
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, expected);
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn test_read_after_close_errors() {
        let (caller, answer) = session_pair().await;
        caller.close().await;
        let mut buf = [0u8; 4];
        assert!(answer.read(&mut buf).await.is_err());
    }
}
