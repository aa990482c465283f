//! Live worker error types.
//!
//! Two layers of error:
//! - [`ChannelError`] is what a single `start_channel` subscriber receives
//!   through its completion. It has a stable numeric code used on the worker
//!   protocol wire.
//! - [`LwError`] is the service-level error returned by handles, startup and
//!   the worker entry point. Internal details are logged but not exposed to
//!   HTTP clients.

use crate::config::ConfigError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use worker_protocol::CodecError;

/// Outcome delivered to a channel subscriber: the playback URL or the reason
/// the channel could not serve it.
pub type ChannelResult = Result<String, ChannelError>;

/// Per-subscriber channel error.
///
/// Wire codes (worker protocol `error_code`):
/// - `InvalidRequest`: 1
/// - `EngineUnavailable`: 2
/// - `EngineFailure`: 3
/// - `Aborted`: 4
/// - `ProcessDied`: 5
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelError {
    /// Request token could not be decoded to a resource id.
    #[error("invalid request")]
    InvalidRequest,

    /// Engine refused to allocate a channel.
    #[error("engine unavailable")]
    EngineUnavailable,

    /// Engine reported the channel as failed.
    #[error("engine failure")]
    EngineFailure,

    /// Subscriber or channel cancelled before completion.
    #[error("operation aborted")]
    Aborted,

    /// Worker process exited without being asked to.
    #[error("worker process died")]
    ProcessDied,
}

impl ChannelError {
    /// Returns the worker protocol code for this error (never 0).
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            ChannelError::InvalidRequest => 1,
            ChannelError::EngineUnavailable => 2,
            ChannelError::EngineFailure => 3,
            ChannelError::Aborted => 4,
            ChannelError::ProcessDied => 5,
        }
    }

    /// Parse a worker protocol code. `0` (success) and unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ChannelError::InvalidRequest),
            2 => Some(ChannelError::EngineUnavailable),
            3 => Some(ChannelError::EngineFailure),
            4 => Some(ChannelError::Aborted),
            5 => Some(ChannelError::ProcessDied),
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelError::InvalidRequest => "invalid_request",
            ChannelError::EngineUnavailable => "engine_unavailable",
            ChannelError::EngineFailure => "engine_failure",
            ChannelError::Aborted => "aborted",
            ChannelError::ProcessDied => "process_died",
        }
    }

    /// HTTP status the gateway answers with.
    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            ChannelError::InvalidRequest => StatusCode::BAD_REQUEST,
            ChannelError::EngineUnavailable | ChannelError::Aborted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChannelError::EngineFailure | ChannelError::ProcessDied => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns a client-safe error message.
    #[must_use]
    pub fn client_message(self) -> String {
        match self {
            ChannelError::InvalidRequest => "Invalid channel request".to_string(),
            ChannelError::EngineUnavailable => {
                "Channel capacity unavailable, please try again".to_string()
            }
            ChannelError::EngineFailure | ChannelError::ProcessDied => {
                "Channel failed to start".to_string()
            }
            ChannelError::Aborted => "Channel request was cancelled".to_string(),
        }
    }
}

/// Convert a worker's `(error_code, url)` report into a subscriber result.
///
/// Unknown non-zero codes are treated as engine failures.
#[must_use]
pub fn result_from_wire(error_code: u16, url: String) -> ChannelResult {
    if error_code == 0 {
        Ok(url)
    } else {
        Err(ChannelError::from_code(error_code).unwrap_or(ChannelError::EngineFailure))
    }
}

/// Live worker service error type.
#[derive(Debug, Error)]
pub enum LwError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tokio runtime (and therefore no timer) available for the pool.
    #[error("Runtime unavailable: {0}")]
    Runtime(String),

    /// Worker process I/O failed.
    #[error("Worker I/O error: {0}")]
    Io(String),

    /// Worker protocol violation.
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Management channel list could not be fetched or parsed.
    #[error("Channel list error: {0}")]
    ChannelList(String),

    /// Channel request failed.
    #[error("Channel error: {0}")]
    Channel(ChannelError),

    /// Internal error (actor mailbox closed, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LwError {
    /// Returns a numeric error code for logs and admin responses.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            LwError::Config(_) => 2,
            LwError::Runtime(_) | LwError::Internal(_) => 6,
            LwError::Io(_) | LwError::Protocol(_) => 8,
            LwError::ChannelList(_) => 9,
            LwError::Channel(e) => 100 + i32::from(e.code()),
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            LwError::Channel(e) => e.client_message(),
            LwError::Config(_)
            | LwError::Runtime(_)
            | LwError::Io(_)
            | LwError::Protocol(_)
            | LwError::ChannelList(_)
            | LwError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for LwError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            LwError::Channel(e) => (e.status_code(), e.as_str()),
            other => {
                // Log actual error server-side, return generic message to client
                tracing::error!(target: "lw.gateway", error = %other, "Request failed internally");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.client_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<ChannelError> for LwError {
    fn from(err: ChannelError) -> Self {
        LwError::Channel(err)
    }
}

impl From<ConfigError> for LwError {
    fn from(err: ConfigError) -> Self {
        LwError::Config(err.to_string())
    }
}

impl From<CodecError> for LwError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => LwError::Io(e.to_string()),
            other => LwError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for LwError {
    fn from(err: std::io::Error) -> Self {
        LwError::Io(err.to_string())
    }
}
