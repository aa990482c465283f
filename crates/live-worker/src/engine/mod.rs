//! Engine binding and channel drivers.
//!
//! [`NativeEngine`] is the narrow, handle-based API of the opaque streaming
//! engine. The pool never talks to it directly; it drives a [`ChannelDriver`]
//! strategy instead:
//!
//! - [`InProcessDriver`] runs the engine inside this process.
//! - [`ProcessDriver`] runs each channel's engine in a dedicated worker
//!   process, spoken to over framed stdio.
//!
//! Drivers never touch pool state. Anything asynchronous (engine callbacks,
//! worker reports) is posted as a [`DriverEvent`] through the
//! [`DriverEventSink`] and handed back to the driver via
//! [`ChannelDriver::resolve`] on the pool's own task, which is where the
//! exactly-once completion rule is enforced.

pub mod in_process;
pub mod loopback;
pub mod process;

pub use in_process::InProcessDriver;
pub use loopback::LoopbackEngine;
pub use process::{ProcessDriver, WorkerCommand};

use crate::errors::{ChannelError, ChannelResult};
use crate::pool::{ChannelKey, PortHints};
use serde::Serialize;
use tokio::sync::mpsc;
use worker_protocol::StartResult;

/// Opaque engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Runtime statistics for one engine channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub media_port: u16,
    pub buffer_percent: u32,
    pub buffer_time_ms: u32,
    pub download_speed: u32,
    pub upload_speed: u32,
    pub connection_count: u32,
    pub pending_peer_count: u32,
    pub total_peer_count: u32,
}

impl ChannelStats {
    /// Playback URL served by the engine's local media port.
    #[must_use]
    pub fn playback_url(&self) -> String {
        format!("http://127.0.0.1:{}/1.asf", self.media_port)
    }
}

/// Readiness callback. Invoked at most once per handle, possibly from a
/// foreign thread.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// The native streaming engine.
pub trait NativeEngine: Send + 'static {
    /// Allocate a channel. `None` means the engine refused.
    fn start(&mut self, uri: &str, tcp_port: u16, udp_port: u16) -> Option<NativeHandle>;

    /// Release a channel. The handle must not be used afterwards.
    fn stop(&mut self, handle: NativeHandle);

    /// Current statistics. `None` means the engine no longer considers the
    /// handle live.
    fn get_status(&self, handle: NativeHandle) -> Option<ChannelStats>;

    /// Register the readiness callback for a started handle.
    fn set_completion_callback(&mut self, handle: NativeHandle, callback: CompletionCallback);
}

/// Driver-side reference to a started channel.
///
/// Not `Clone`: it is moved into [`ChannelDriver::stop`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DriverHandle(ChannelKey);

impl DriverHandle {
    #[must_use]
    pub const fn new(key: ChannelKey) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn key(&self) -> ChannelKey {
        self.0
    }
}

/// Everything a driver needs to start a channel.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub key: ChannelKey,
    /// Engine URI (`synacast:/<token>`).
    pub uri: String,
    pub hints: PortHints,
}

/// What happened to the handle passed to [`ChannelDriver::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Resource released and no completion will follow.
    Released,
    /// The channel had not completed yet; its completion (`Aborted`) has been
    /// posted and will be resolved on the pool loop.
    CompletionPending,
}

/// Asynchronous driver notification, resolved on the pool loop.
#[derive(Debug)]
pub enum DriverEvent {
    /// Native engine readiness callback fired.
    EngineSignal { key: ChannelKey, ready: bool },
    /// Worker process sent its start result.
    WorkerReport { key: ChannelKey, report: StartResult },
    /// Final completion for a channel stopped before it reported.
    Finished { key: ChannelKey, result: ChannelResult },
}

impl DriverEvent {
    #[must_use]
    pub const fn key(&self) -> ChannelKey {
        match self {
            DriverEvent::EngineSignal { key, .. }
            | DriverEvent::WorkerReport { key, .. }
            | DriverEvent::Finished { key, .. } => *key,
        }
    }
}

/// Where drivers and engine callbacks post [`DriverEvent`]s.
#[derive(Debug, Clone)]
pub struct DriverEventSink(mpsc::UnboundedSender<DriverEvent>);

impl DriverEventSink {
    /// Create a sink and the receiver the pool loop drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Post an event. Returns `false` if the pool loop is gone.
    pub fn post(&self, event: DriverEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

/// A channel the driver found broken during a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    pub key: ChannelKey,
    pub error: ChannelError,
}

/// Strategy the pool uses to run channels.
pub trait ChannelDriver: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Start a channel. `None` means the engine refused.
    ///
    /// Every started handle produces exactly one completion, delivered as a
    /// [`DriverEvent`] and accepted by [`resolve`](Self::resolve).
    fn start(&mut self, request: &StartRequest, events: &DriverEventSink) -> Option<DriverHandle>;

    /// Release a channel.
    fn stop(&mut self, handle: DriverHandle, events: &DriverEventSink) -> StopOutcome;

    /// Accept or discard a posted event. Returns the completion to apply, at
    /// most once per started handle.
    fn resolve(&mut self, event: DriverEvent) -> Option<(ChannelKey, ChannelResult)>;

    /// Non-blocking health check; appends broken channels to `failures`.
    fn check_channels(&mut self, failures: &mut Vec<ChannelFailure>);

    /// Engine statistics, when the driver can see them.
    fn status(&self, handle: &DriverHandle) -> Option<ChannelStats>;

    /// Release everything still running.
    fn shutdown(&mut self);
}
