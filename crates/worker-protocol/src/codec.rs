//! Codec for encoding and decoding worker frames.

use crate::frame::{Frame, FrameKind, StartResult, StopRequest};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload exceeds `Frame::MAX_PAYLOAD`
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Unsupported version
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid frame kind
    #[error("Invalid frame kind: {0}")]
    InvalidFrameKind(u8),

    /// Payload is not valid UTF-8
    #[error("Invalid payload encoding")]
    InvalidPayload,

    /// Stream ended in the middle of a frame
    #[error("Stream ended mid-frame ({0} bytes buffered)")]
    TruncatedStream(usize),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a worker frame to bytes
///
/// # Errors
///
/// Returns `PayloadTooLarge` if the payload exceeds `Frame::MAX_PAYLOAD`
pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
    let payload = frame.payload().as_bytes();
    if payload.len() > Frame::MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(Frame::HEADER_SIZE + payload.len());

    // Version (1 byte)
    buf.put_u8(Frame::VERSION);

    // Kind (1 byte)
    buf.put_u8(frame.kind() as u8);

    // Error code (2 bytes)
    buf.put_u16(frame.error_code());

    // Reserved (4 bytes)
    buf.put_bytes(0, 4);

    // Payload Length (4 bytes)
    buf.put_u32(payload_len);

    // Payload
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Decode one worker frame from the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything while the buffer holds less
/// than a complete frame. On success the frame's bytes are consumed.
///
/// # Errors
///
/// Returns an error if the header is malformed or the payload is invalid
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    let Some(mut header) = buf.get(..Frame::HEADER_SIZE) else {
        return Ok(None);
    };

    // Version (1 byte)
    let version = header.get_u8();
    if version != Frame::VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    // Kind (1 byte)
    let raw_kind = header.get_u8();
    let kind = FrameKind::from_u8(raw_kind).ok_or(CodecError::InvalidFrameKind(raw_kind))?;

    // Error code (2 bytes)
    let error_code = header.get_u16();

    // Reserved (4 bytes) - skip
    header.advance(4);

    // Payload Length (4 bytes)
    let payload_len = header.get_u32() as usize;
    if payload_len > Frame::MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }

    if buf.len() < Frame::HEADER_SIZE + payload_len {
        buf.reserve(Frame::HEADER_SIZE + payload_len - buf.len());
        return Ok(None);
    }

    buf.advance(Frame::HEADER_SIZE);
    let payload = buf.split_to(payload_len);
    let text = String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidPayload)?;

    let frame = match kind {
        FrameKind::StartResult => Frame::StartResult(StartResult {
            error_code,
            url: text,
        }),
        FrameKind::StopRequest => Frame::StopRequest(StopRequest {
            error_code,
            message: text,
        }),
    };

    Ok(Some(frame))
}
