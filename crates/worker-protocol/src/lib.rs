//! Worker protocol for live-worker process isolation.
//!
//! A channel running in its own worker process talks to the pool over the
//! child's stdin/stdout. This crate defines the two messages exchanged on that
//! private byte stream and a length-framed binary codec for them:
//!
//! - `StartResult` (worker -> pool): `(error_code, playback_url)`, sent once
//!   when the worker's engine reports readiness or failure.
//! - `StopRequest` (pool -> worker): `(error_code, message)`, after which the
//!   worker releases its engine handle and exits.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod frame;
pub mod stream;

pub use codec::{decode_frame, encode_frame, CodecError};
pub use frame::{Frame, FrameKind, StartResult, StopRequest};
pub use stream::{FrameReader, FrameWriter};
