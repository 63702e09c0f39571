//! Length-prefixed message framing.
//!
//! Every protocol message travels as `u16-big-endian length ‖ body` over an
//! ordered reliable byte stream. Framing preserves message boundaries; no
//! fragmentation is visible to upper layers. Short reads and EOF surface as
//! errors to the stream owner, who is expected to tear the stream down.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{Result, TransportError};

/// Maximum frame body length (the u16 prefix bound).
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

/// The underlying byte stream a framed stream owns.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

/// Read half of a framed stream.
pub struct FramedReader {
    io: ReadHalf<Box<dyn Conn>>,
}

impl FramedReader {
    /// Read one complete frame body.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] on EOF or short read.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.io
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        self.io
            .read_exact(&mut body)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(body)
    }
}

/// Write half of a framed stream.
pub struct FramedWriter {
    io: WriteHalf<Box<dyn Conn>>,
}

impl FramedWriter {
    /// Write one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Framing`] if the body exceeds
    /// [`MAX_FRAME_LENGTH`], or [`TransportError::Io`] on write failure.
    pub async fn write_msg(&mut self, body: &[u8]) -> Result<()> {
        let len = u16::try_from(body.len()).map_err(|_| {
            TransportError::Framing(format!("frame body {} exceeds u16 prefix", body.len()))
        })?;
        self.io
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.io
            .write_all(body)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.io
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Shut the write side down, signalling EOF to the remote reader.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// A message-framed view over one ordered byte stream.
pub struct FramedStream {
    reader: FramedReader,
    writer: FramedWriter,
}

impl FramedStream {
    /// Frame an owned byte stream.
    pub fn new(conn: Box<dyn Conn>) -> Self {
        let (read, write) = tokio::io::split(conn);
        Self {
            reader: FramedReader { io: read },
            writer: FramedWriter { io: write },
        }
    }

    /// Read one complete frame body.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>> {
        self.reader.read_msg().await
    }

    /// Write one complete frame.
    pub async fn write_msg(&mut self, body: &[u8]) -> Result<()> {
        self.writer.write_msg(body).await
    }

    /// Split into independently owned halves, so one task can read while
    /// others write.
    pub fn split(self) -> (FramedReader, FramedWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_pair() -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FramedStream::new(Box::new(a)), FramedStream::new(Box::new(b)))
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_boundaries() {
        let (mut a, mut b) = framed_pair();
        a.write_msg(b"first").await.expect("write");
        a.write_msg(b"second message").await.expect("write");

        assert_eq!(b.read_msg().await.expect("read"), b"first");
        assert_eq!(b.read_msg().await.expect("read"), b"second message");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut a, mut b) = framed_pair();
        a.write_msg(b"").await.expect("write");
        assert!(b.read_msg().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, _b) = framed_pair();
        let body = vec![0u8; MAX_FRAME_LENGTH + 1];
        assert!(a.write_msg(&body).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_error() {
        let (a, mut b) = framed_pair();
        let (_reader, mut writer) = a.split();
        writer.shutdown().await;
        drop(_reader);
        assert!(b.read_msg().await.is_err());
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let (a, mut b) = framed_pair();
        let (mut reader, mut writer) = a.split();

        let echo = tokio::spawn(async move {
            let msg = b.read_msg().await.expect("read");
            b.write_msg(&msg).await.expect("write");
        });

        writer.write_msg(b"ping").await.expect("write");
        let back = reader.read_msg().await.expect("read");
        assert_eq!(back, b"ping");
        echo.await.expect("echo task");
    }
}
