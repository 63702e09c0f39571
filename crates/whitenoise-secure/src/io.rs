//! The byte-stream seam the secure session runs over, and record framing.
//!
//! The circuit connection exposes interior-mutable read/write (many tasks
//! hold the same handle), so the seam takes `&self` rather than `&mut self`
//! and leaves locking to the implementation. Records and handshake frames
//! inside the circuit use a u32-big-endian length prefix, distinct from the
//! u16 framing of the outer transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{Result, SecureError};

/// Length of the record prefix inside a circuit.
pub const RECORD_PREFIX_LENGTH: usize = 4;

/// Ordered reliable byte stream between the two circuit endpoints.
#[async_trait]
pub trait CircuitIo: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes. `Ok(0)` only on a closed stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` as one unit.
    async fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Close the stream, releasing any blocked readers.
    async fn close(&self);
}

pub(crate) async fn read_exact(io: &dyn CircuitIo, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(SecureError::Closed("eof mid-frame".to_string()));
        }
        filled += n;
    }
    Ok(())
}

/// Read one u32-prefixed frame, bounded by `max`.
pub(crate) async fn read_frame(io: &dyn CircuitIo, max: usize) -> Result<Vec<u8>> {
    let mut prefix = [0u8; RECORD_PREFIX_LENGTH];
    read_exact(io, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(SecureError::Framing(format!(
            "frame length {len} exceeds maximum {max}"
        )));
    }
    let mut body = vec![0u8; len];
    read_exact(io, &mut body).await?;
    Ok(body)
}

/// Write one u32-prefixed frame as a single unit.
pub(crate) async fn write_frame(io: &dyn CircuitIo, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| SecureError::Framing("frame too large for u32 prefix".to_string()))?;
    let mut frame = Vec::with_capacity(RECORD_PREFIX_LENGTH + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    io.write_all(&frame).await
}

/// Adapter running a secure session over any plain byte stream. Used by
/// tests and tooling; production circuits implement [`CircuitIo`] directly.
pub struct StreamIo<S> {
    reader: Mutex<tokio::io::ReadHalf<S>>,
    writer: Mutex<tokio::io::WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamIo<S> {
    pub fn new(stream: S) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> CircuitIo for StreamIo<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.reader
            .lock()
            .await
            .read(buf)
            .await
            .map_err(|e| SecureError::Closed(e.to_string()))
    }

    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.writer
            .lock()
            .await
            .write_all(buf)
            .await
            .map_err(|e| SecureError::Closed(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let left = StreamIo::new(a);
        let right = StreamIo::new(b);

        write_frame(left.as_ref(), b"record body").await.expect("write");
        let body = read_frame(right.as_ref(), 1024).await.expect("read");
        assert_eq!(body, b"record body");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let left = StreamIo::new(a);
        let right = StreamIo::new(b);

        write_frame(left.as_ref(), &vec![0u8; 512]).await.expect("write");
        assert!(read_frame(right.as_ref(), 16).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (a, b) = tokio::io::duplex(4096);
        let left = StreamIo::new(a);
        let right = StreamIo::new(b);

        // Prefix promises 100 bytes but only 3 arrive before close.
        left.write_all(&100u32.to_be_bytes()).await.expect("write");
        left.write_all(b"abc").await.expect("write");
        left.close().await;

        assert!(read_frame(right.as_ref(), 1024).await.is_err());
    }
}
