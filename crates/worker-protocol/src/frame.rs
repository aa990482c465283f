//! Frame types exchanged between the pool and a worker process.

/// Kind of frame on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Worker -> pool: engine start outcome
    StartResult = 0x01,
    /// Pool -> worker: release the channel and exit
    StopRequest = 0x02,
}

impl FrameKind {
    /// Parse a frame kind from its wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StartResult),
            0x02 => Some(Self::StopRequest),
            _ => None,
        }
    }
}

/// Outcome of the worker's engine start.
///
/// `error_code == 0` means success and `url` carries the playback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartResult {
    /// 0 on success, otherwise a channel error code
    pub error_code: u16,
    /// Playback URL (empty on failure)
    pub url: String,
}

impl StartResult {
    /// Successful start with the given playback URL
    #[must_use]
    pub fn ready(url: impl Into<String>) -> Self {
        Self {
            error_code: 0,
            url: url.into(),
        }
    }

    /// Failed start with the given error code
    #[must_use]
    pub fn failed(error_code: u16) -> Self {
        Self {
            error_code,
            url: String::new(),
        }
    }

    /// Whether the start succeeded
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// Request for the worker to stop its channel and exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    /// Reason code (0 for a normal release)
    pub error_code: u16,
    /// Free-form reason, logged by the worker
    pub message: String,
}

impl StopRequest {
    /// Stop request with the given reason code and message
    #[must_use]
    pub fn new(error_code: u16, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }
}

/// A worker protocol frame
///
/// Frame format (12 bytes header):
/// - Version: 1 byte
/// - Kind: 1 byte
/// - Error code: 2 bytes
/// - Reserved: 4 bytes
/// - Payload Length: 4 bytes
/// - Payload: variable (UTF-8 url or message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Worker -> pool
    StartResult(StartResult),
    /// Pool -> worker
    StopRequest(StopRequest),
}

impl Frame {
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 12;

    /// Current protocol version
    pub const VERSION: u8 = 1;

    /// Largest payload accepted by the decoder
    pub const MAX_PAYLOAD: usize = 64 * 1024;

    /// Wire kind of this frame
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::StartResult(_) => FrameKind::StartResult,
            Self::StopRequest(_) => FrameKind::StopRequest,
        }
    }

    /// Error code carried by this frame
    #[must_use]
    pub const fn error_code(&self) -> u16 {
        match self {
            Self::StartResult(result) => result.error_code,
            Self::StopRequest(request) => request.error_code,
        }
    }

    /// Text payload carried by this frame
    #[must_use]
    pub fn payload(&self) -> &str {
        match self {
            Self::StartResult(result) => &result.url,
            Self::StopRequest(request) => &request.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_from_u8() {
        assert_eq!(FrameKind::from_u8(0x01), Some(FrameKind::StartResult));
        assert_eq!(FrameKind::from_u8(0x02), Some(FrameKind::StopRequest));
        assert_eq!(FrameKind::from_u8(0x00), None);
        assert_eq!(FrameKind::from_u8(0xff), None);
    }

    #[test]
    fn test_start_result_constructors() {
        let ok = StartResult::ready("http://127.0.0.1:9100/1.asf");
        assert!(ok.is_ok());
        assert_eq!(ok.url, "http://127.0.0.1:9100/1.asf");

        let failed = StartResult::failed(2);
        assert!(!failed.is_ok());
        assert!(failed.url.is_empty());
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::StopRequest(StopRequest::new(4, "released"));
        assert_eq!(frame.kind(), FrameKind::StopRequest);
        assert_eq!(frame.error_code(), 4);
        assert_eq!(frame.payload(), "released");
    }
}
