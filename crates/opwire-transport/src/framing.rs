//! Async frame reading and writing over any byte stream.
//!
//! The reader and writer are generic over `AsyncRead`/`AsyncWrite`, so
//! the same code runs over split TCP halves in production and over
//! `tokio::io::duplex` pipes in tests.

use opwire_protocol::{Frame, FrameHeader, Opcode, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Limits applied to every frame in both directions.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum body size in bytes. Default: 16 MiB.
    pub max_body_len: usize,
}

impl FrameConfig {
    /// Default body limit.
    pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_body_len: Self::DEFAULT_MAX_BODY_LEN,
        }
    }
}

/// Reads whole frames from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a readable stream.
    pub fn new(inner: R, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream cleanly between
    /// frames. A close in the middle of a frame is an error.
    ///
    /// Not cancel safe: dropping the future mid-frame loses the partial
    /// frame, so only cancel when the stream is being abandoned.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        let mut header = [0u8; HEADER_LEN];

        // The first byte decides between "clean close" and "torn frame".
        let first = self
            .inner
            .read(&mut header[..1])
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if first == 0 {
            return Ok(None);
        }
        self.read_exact(&mut header[1..]).await?;

        let header = FrameHeader::decode(&header)?;
        let len = header.body_len as usize;
        if len > self.config.max_body_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.config.max_body_len,
            });
        }

        let mut body = vec![0u8; len];
        self.read_exact(&mut body).await?;

        Ok(Some(Frame {
            opcode: header.opcode,
            encrypted: header.encrypted,
            body,
        }))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                TransportError::ConnectionClosed("peer closed mid-frame".into()),
            ),
            Err(e) => Err(TransportError::ReceiveFailed(e)),
        }
    }
}

/// Writes whole frames to a byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writable stream.
    pub fn new(inner: W, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Writes one frame and flushes it.
    pub async fn write_frame(
        &mut self,
        opcode: Opcode,
        encrypted: bool,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let max = self.config.max_body_len.min(i32::MAX as usize);
        if body.len() > max {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max,
            });
        }

        let header = FrameHeader {
            opcode,
            encrypted,
            body_len: body.len() as u32,
        };
        self.inner
            .write_all(&header.encode())
            .await
            .map_err(TransportError::SendFailed)?;
        self.inner
            .write_all(body)
            .await
            .map_err(TransportError::SendFailed)?;
        self.inner.flush().await.map_err(TransportError::SendFailed)
    }

    /// Shuts down the write side so the peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(
        max_body_len: usize,
    ) -> (
        FrameWriter<tokio::io::DuplexStream>,
        FrameReader<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = FrameConfig { max_body_len };
        (FrameWriter::new(a, config), FrameReader::new(b, config))
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut writer, mut reader) = pair(1024);
        writer.write_frame(42, true, b"hello").await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, 42);
        assert!(frame.encrypted);
        assert_eq!(frame.body, b"hello");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let (mut writer, mut reader) = pair(1024);
        writer.write_frame(1, false, &[]).await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert!(frame.body.is_empty());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut writer, mut reader) = pair(1024);
        for opcode in 0..20 {
            writer.write_frame(opcode, false, &[opcode as u8]).await.unwrap();
        }
        for opcode in 0..20 {
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.opcode, opcode);
        }
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let (mut writer, mut reader) = pair(1024);
        writer.write_frame(1, false, b"x").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b, FrameConfig::default());

        // Header promises 10 bytes, only 3 follow.
        let header = FrameHeader {
            opcode: 1,
            encrypted: false,
            body_len: 10,
        };
        a.write_all(&header.encode()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b, FrameConfig { max_body_len: 4 });

        let header = FrameHeader {
            opcode: 1,
            encrypted: false,
            body_len: 5,
        };
        a.write_all(&header.encode()).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 5, max: 4 }));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut writer, _reader) = pair(4);
        let err = writer.write_frame(1, false, b"12345").await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 5, max: 4 }));
    }

    #[tokio::test]
    async fn test_negative_length_is_header_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b, FrameConfig::default());

        let mut raw = [0u8; HEADER_LEN];
        raw[5..].copy_from_slice(&(-3i32).to_le_bytes());
        a.write_all(&raw).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Header(_)));
    }
}
