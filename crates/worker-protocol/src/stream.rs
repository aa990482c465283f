//! Async frame reader/writer over a byte stream.

use crate::codec::{decode_frame, encode_frame, CodecError};
use crate::frame::Frame;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Initial read buffer capacity.
const READ_BUFFER_CAPACITY: usize = 1024;

/// Reads frames from an `AsyncRead`.
///
/// Partially received frames stay buffered inside the reader, so
/// `next_frame` is cancel-safe and can be used as a `select!` branch.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a readable stream
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails, ends mid-frame, or carries a
    /// malformed frame
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            match decode_frame(&mut self.buffer) {
                Ok(Some(frame)) => {
                    trace!(target: "wp.stream", kind = ?frame.kind(), "Frame received");
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        target: "wp.stream",
                        error = %e,
                        buffered = self.buffer.len(),
                        "Malformed frame on stream"
                    );
                    return Err(e);
                }
            }

            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                debug!(
                    target: "wp.stream",
                    buffered = self.buffer.len(),
                    "Stream ended mid-frame"
                );
                return Err(CodecError::TruncatedStream(self.buffer.len()));
            }
        }
    }
}

/// Writes frames to an `AsyncWrite`.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writable stream
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one frame
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the underlying write fails
    pub async fn send(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let bytes = encode_frame(frame)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half, signalling end of stream to the peer
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::frame::{StartResult, StopRequest};

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let frame = Frame::StartResult(StartResult::ready("http://127.0.0.1:9100/1.asf"));
        writer.send(&frame).await.unwrap();

        assert_eq!(reader.next_frame().await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_reader_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);

        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_truncated_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[Frame::VERSION, 0x02]).await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server);

        assert!(matches!(
            reader.next_frame().await,
            Err(CodecError::TruncatedStream(2))
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_malformed_frame() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut client, server) = tokio::io::duplex(64);
        let mut header = [0u8; 12];
        header[0] = 9;
        header[1] = 0x01;
        client.write_all(&header).await.unwrap();
        let mut reader = FrameReader::new(server);

        assert!(matches!(
            reader.next_frame().await,
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[tokio::test]
    async fn test_reader_handles_small_pipe_chunks() {
        // A 16 byte pipe forces the payload to arrive over several reads
        let (client, server) = tokio::io::duplex(16);
        let message = "stop: channel evicted after idle grace period";
        let frame = Frame::StopRequest(StopRequest::new(4, message));

        let expected = frame.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client);
            writer.send(&frame).await.unwrap();
            writer.close().await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.next_frame().await.unwrap(), Some(expected));
        assert!(reader.next_frame().await.unwrap().is_none());
        writer_task.await.unwrap();
    }
}
