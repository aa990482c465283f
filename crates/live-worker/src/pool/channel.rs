//! Channel entity and the handles subscribers hold on it.

use crate::engine::{ChannelStats, DriverHandle};
use crate::errors::{ChannelError, ChannelResult};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Pool-unique channel identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKey(pub u64);

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Caller-supplied port hints. Zero means "no preference".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortHints {
    pub tcp: u16,
    pub udp: u16,
}

impl PortHints {
    #[must_use]
    pub const fn new(tcp: u16, udp: u16) -> Self {
        Self { tcp, udp }
    }

    /// Both ports given. Only fully specified hints can trigger a reconnect.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.tcp != 0 && self.udp != 0
    }
}

/// Channel lifecycle status.
///
/// Transitions are monotonic: `Started -> {Working | Cancelling} -> Stopped`
/// and `Working -> Cancelling -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Started,
    Working,
    Cancelling,
    Stopped,
}

impl ChannelStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Started => "started",
            ChannelStatus::Working => "working",
            ChannelStatus::Cancelling => "cancelling",
            ChannelStatus::Stopped => "stopped",
        }
    }

    /// Channel still holds (or is acquiring) an engine resource.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, ChannelStatus::Started | ChannelStatus::Working)
    }
}

/// A subscriber's claim on a channel.
///
/// Deliberately not `Clone`: `stop_channel` consumes the claim through
/// `&mut`, leaving a null handle behind so a second stop is a no-op.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChannelHandle {
    channel: Option<ChannelKey>,
    cancel_token: usize,
}

impl ChannelHandle {
    pub(crate) const fn new(channel: ChannelKey, cancel_token: usize) -> Self {
        Self {
            channel: Some(channel),
            cancel_token,
        }
    }

    /// Handle that refers to no channel.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            channel: None,
            cancel_token: 0,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.channel.is_none()
    }

    #[must_use]
    pub const fn channel(&self) -> Option<ChannelKey> {
        self.channel
    }

    /// 1-based pending slot, or 0 when the subscriber attached to a working channel.
    #[must_use]
    pub const fn cancel_token(&self) -> usize {
        self.cancel_token
    }

    /// Move the claim out, leaving this handle null.
    pub fn take(&mut self) -> ChannelHandle {
        std::mem::take(self)
    }
}

/// Sending half of a subscriber's one-shot completion.
#[derive(Debug)]
pub struct Completion(oneshot::Sender<ChannelResult>);

impl Completion {
    /// Deliver the result. A receiver that has gone away is ignored.
    pub fn fire(self, result: ChannelResult) {
        let _ = self.0.send(result);
    }
}

/// Receiving half of a subscriber's completion. Resolves exactly once.
#[derive(Debug)]
pub struct CompletionReceiver(oneshot::Receiver<ChannelResult>);

impl CompletionReceiver {
    /// Wait for the channel result.
    ///
    /// If the pool dropped the sender without firing (actor gone), this
    /// resolves to `Aborted`.
    pub async fn recv(self) -> ChannelResult {
        self.0.await.unwrap_or(Err(ChannelError::Aborted))
    }

    /// Non-blocking check, `None` while the result is still pending.
    pub fn try_recv(&mut self) -> Option<ChannelResult> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ChannelError::Aborted)),
        }
    }
}

/// Create a linked completion pair.
#[must_use]
pub fn completion() -> (Completion, CompletionReceiver) {
    let (tx, rx) = oneshot::channel();
    (Completion(tx), CompletionReceiver(rx))
}

/// What `start_channel` hands back: the claim plus the pending result.
#[derive(Debug)]
pub struct Subscription {
    pub handle: ChannelHandle,
    pub completion: CompletionReceiver,
}

impl Subscription {
    #[must_use]
    pub fn into_parts(self) -> (ChannelHandle, CompletionReceiver) {
        (self.handle, self.completion)
    }
}

/// One engine-backed channel, shared by every subscriber of its resource id.
#[derive(Debug)]
pub(crate) struct Channel {
    pub key: ChannelKey,
    pub resource_id: String,
    pub original_request: String,
    pub hints: PortHints,
    pub reference_count: usize,
    pub status: ChannelStatus,
    pub expire_countdown: u32,
    pub engine_handle: Option<DriverHandle>,
    pub cached_result: Option<ChannelResult>,
    pending: Vec<Option<Completion>>,
    pub created_at: i64,
    started_at: Instant,
}

impl Channel {
    pub fn new(
        key: ChannelKey,
        resource_id: String,
        original_request: String,
        hints: PortHints,
        engine_handle: DriverHandle,
    ) -> Self {
        Self {
            key,
            resource_id,
            original_request,
            hints,
            reference_count: 0,
            status: ChannelStatus::Started,
            expire_countdown: 0,
            engine_handle: Some(engine_handle),
            cached_result: None,
            pending: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
            started_at: Instant::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.reference_count == 0
    }

    /// Attach a subscriber and return its cancel token.
    ///
    /// On a working channel the cached result is delivered immediately
    /// through the completion and the token is 0.
    pub fn subscribe(&mut self, completion: Completion) -> usize {
        self.reference_count += 1;
        self.expire_countdown = 0;
        match (&self.status, &self.cached_result) {
            (ChannelStatus::Working, Some(result)) => {
                completion.fire(result.clone());
                0
            }
            _ => {
                self.pending.push(Some(completion));
                self.pending.len()
            }
        }
    }

    /// Fire the subscriber's own slot with `Aborted`, if still pending.
    pub fn cancel_subscriber(&mut self, cancel_token: usize) {
        let slot = cancel_token
            .checked_sub(1)
            .and_then(|index| self.pending.get_mut(index))
            .and_then(Option::take);
        if let Some(completion) = slot {
            completion.fire(Err(ChannelError::Aborted));
        }
    }

    /// Fire every unfired slot, in subscription order, and clear the slots.
    ///
    /// Callers flush only when the channel leaves `Started`, after which no
    /// slot is ever pushed again. Outstanding cancel tokens then miss and
    /// are no-ops.
    pub fn flush(&mut self, result: &ChannelResult) -> usize {
        let mut fired = 0;
        for completion in self.pending.drain(..).flatten() {
            completion.fire(result.clone());
            fired += 1;
        }
        fired
    }

    /// One idle tick. Returns `true` when the grace period has run out.
    pub fn tick_expiry(&mut self) -> bool {
        self.expire_countdown = self.expire_countdown.saturating_sub(1);
        self.expire_countdown == 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self, stats: Option<ChannelStats>) -> ChannelSnapshot {
        ChannelSnapshot {
            key: self.key,
            resource_id: self.resource_id.clone(),
            original_request: self.original_request.clone(),
            status: self.status,
            reference_count: self.reference_count,
            expire_countdown: self.expire_countdown,
            pending: self.pending_count(),
            hints: self.hints,
            created_at: self.created_at,
            stats,
        }
    }
}

/// Admin view of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub key: ChannelKey,
    pub resource_id: String,
    /// Token the channel was created from.
    pub original_request: String,
    pub status: ChannelStatus,
    pub reference_count: usize,
    pub expire_countdown: u32,
    pub pending: usize,
    pub hints: PortHints,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ChannelStats>,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub channels: usize,
    pub active: usize,
    pub idle: usize,
    pub max_parallel: usize,
}
