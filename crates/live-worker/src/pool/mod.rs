//! Ref-counted, capacity-bounded channel pool.
//!
//! The pool is a plain synchronous state machine. It is owned by exactly one
//! task (the pool actor), so every method runs to completion before the next
//! one starts and no locking is needed. Completions are delivered through
//! one-shot channels and never run caller code inline.
//!
//! # Admission
//!
//! New subscribers are never rejected for capacity. `max_parallel` bounds how
//! many *idle* live channels are kept warm: after every mutation, idle
//! `Started`/`Working` channels beyond `max_parallel - active` are evicted,
//! least recently idled first.
//!
//! # Eviction ordering
//!
//! `order` holds every tracked channel. Newly created channels go to the back
//! and a channel that goes idle moves to the front. Rebalance walks from the
//! front and keeps the first `budget` idle channels, so the most recently
//! idled channel is evicted last and idle channels nearer the back go first.

mod channel;

pub use channel::{
    completion, ChannelHandle, ChannelKey, ChannelSnapshot, ChannelStatus, Completion,
    CompletionReceiver, PoolStatus, PortHints, Subscription,
};

use crate::engine::{
    ChannelDriver, ChannelFailure, DriverEvent, DriverEventSink, StartRequest, StopOutcome,
};
use crate::errors::{ChannelError, ChannelResult};
use crate::observability::metrics;
use crate::token::{engine_uri, TokenCodec};
use channel::Channel;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Pool tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_parallel: usize,
    /// Sweeper ticks an idle channel survives.
    pub idle_grace_ticks: u32,
    pub sweep_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            idle_grace_ticks: 10,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Why a channel was evicted. Used as the eviction metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Capacity,
    Expired,
    Failed,
    Reconnect,
    Shutdown,
}

impl EvictReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EvictReason::Capacity => "capacity",
            EvictReason::Expired => "expired",
            EvictReason::Failed => "failed",
            EvictReason::Reconnect => "reconnect",
            EvictReason::Shutdown => "shutdown",
        }
    }
}

/// The channel pool.
pub struct ChannelPool {
    driver: Box<dyn ChannelDriver>,
    codec: Arc<dyn TokenCodec>,
    channels: HashMap<ChannelKey, Channel>,
    /// Resource id to its current live channel. Evicted channels are unlinked.
    index: HashMap<String, ChannelKey>,
    order: VecDeque<ChannelKey>,
    next_key: u64,
    max_parallel: usize,
    idle_grace_ticks: u32,
    events: DriverEventSink,
}

impl ChannelPool {
    /// Build a pool. The returned receiver carries driver events that must be
    /// fed back through [`on_driver_event`](Self::on_driver_event).
    #[must_use]
    pub fn new(
        driver: Box<dyn ChannelDriver>,
        codec: Arc<dyn TokenCodec>,
        settings: &PoolSettings,
    ) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, receiver) = DriverEventSink::channel();
        let pool = Self {
            driver,
            codec,
            channels: HashMap::new(),
            index: HashMap::new(),
            order: VecDeque::new(),
            next_key: 0,
            max_parallel: settings.max_parallel,
            idle_grace_ticks: settings.idle_grace_ticks,
            events,
        };
        (pool, receiver)
    }

    /// Subscribe to the channel for `token`, creating it if needed.
    ///
    /// The subscription's completion resolves exactly once. Failures to
    /// decode or start come back as a null handle with the error already
    /// queued on the completion.
    pub fn start_channel(&mut self, token: &str, hints: PortHints) -> Subscription {
        let (completion, receiver) = completion();

        let Some(resource_id) = self.codec.decode(token) else {
            debug!(target: "lw.pool", "Rejected undecodable request token");
            metrics::record_channel_start("invalid");
            completion.fire(Err(ChannelError::InvalidRequest));
            return Subscription {
                handle: ChannelHandle::null(),
                completion: receiver,
            };
        };

        // Fully specified, different hints mean the client reconnected to a
        // new peer endpoint; the old channel cannot serve it
        if let Some(&existing) = self.index.get(&resource_id) {
            let reconnect = hints.is_set()
                && self
                    .channels
                    .get(&existing)
                    .is_some_and(|channel| channel.hints != hints);
            if reconnect {
                info!(
                    target: "lw.pool",
                    channel = %existing,
                    resource_id = %resource_id,
                    tcp = hints.tcp,
                    udp = hints.udp,
                    "Port hints changed, replacing channel"
                );
                self.evict(existing, EvictReason::Reconnect);
                self.compact();
            }
        }

        let (key, outcome) = match self.index.get(&resource_id) {
            Some(&key) => (key, "joined"),
            None => match self.create(token, &resource_id, hints) {
                Some(key) => (key, "created"),
                None => {
                    metrics::record_channel_start("unavailable");
                    completion.fire(Err(ChannelError::EngineUnavailable));
                    return Subscription {
                        handle: ChannelHandle::null(),
                        completion: receiver,
                    };
                }
            },
        };

        let Some(channel) = self.channels.get_mut(&key) else {
            error!(target: "lw.pool", channel = %key, "Index points at a missing channel");
            self.index.remove(&resource_id);
            completion.fire(Err(ChannelError::EngineFailure));
            return Subscription {
                handle: ChannelHandle::null(),
                completion: receiver,
            };
        };

        let cancel_token = channel.subscribe(completion);
        metrics::record_channel_start(outcome);
        debug!(
            target: "lw.pool",
            channel = %key,
            resource_id = %resource_id,
            refs = channel.reference_count,
            cancel_token,
            status = channel.status.as_str(),
            "Subscriber attached"
        );

        self.rebalance();
        Subscription {
            handle: ChannelHandle::new(key, cancel_token),
            completion: receiver,
        }
    }

    fn create(&mut self, token: &str, resource_id: &str, hints: PortHints) -> Option<ChannelKey> {
        self.next_key += 1;
        let key = ChannelKey(self.next_key);
        let request = StartRequest {
            key,
            uri: engine_uri(token),
            hints,
        };

        let Some(handle) = self.driver.start(&request, &self.events) else {
            warn!(
                target: "lw.pool",
                resource_id,
                driver = self.driver.name(),
                "Engine refused to start channel"
            );
            return None;
        };

        info!(target: "lw.pool", channel = %key, resource_id, "Channel created");
        self.channels.insert(
            key,
            Channel::new(
                key,
                resource_id.to_string(),
                token.to_string(),
                hints,
                handle,
            ),
        );
        self.index.insert(resource_id.to_string(), key);
        self.order.push_back(key);
        Some(key)
    }

    /// Release a subscription. The handle is cleared, so a second call is a no-op.
    pub fn stop_channel(&mut self, handle: &mut ChannelHandle) {
        let handle = handle.take();
        let Some(key) = handle.channel() else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&key) else {
            debug!(target: "lw.pool", channel = %key, "Stop for a channel no longer tracked");
            return;
        };

        channel.cancel_subscriber(handle.cancel_token());

        if channel.reference_count == 0 {
            error!(
                target: "lw.pool",
                channel = %key,
                "Reference count underflow on stop, ignoring"
            );
            return;
        }
        channel.reference_count -= 1;

        if channel.is_idle() && channel.status.is_live() {
            channel.expire_countdown = self.idle_grace_ticks;
            self.order.retain(|k| *k != key);
            self.order.push_front(key);
            debug!(
                target: "lw.pool",
                channel = %key,
                expire = self.idle_grace_ticks,
                "Channel idle"
            );
        }

        self.rebalance();
    }

    /// Apply a driver event on the pool loop.
    pub fn on_driver_event(&mut self, event: DriverEvent) {
        if let Some((key, result)) = self.driver.resolve(event) {
            self.complete(key, result);
        }
    }

    fn complete(&mut self, key: ChannelKey, result: ChannelResult) {
        let Some(channel) = self.channels.get_mut(&key) else {
            warn!(target: "lw.pool", channel = %key, "Completion for unknown channel");
            return;
        };

        match channel.status {
            ChannelStatus::Cancelling => {
                channel.status = ChannelStatus::Stopped;
                debug!(target: "lw.pool", channel = %key, "Evicted channel finalized");
                self.compact();
            }
            ChannelStatus::Started => {
                let ok = result.is_ok();
                metrics::record_channel_ready(ok, channel.age());
                channel.status = ChannelStatus::Working;
                let notified = channel.flush(&result);
                info!(
                    target: "lw.pool",
                    channel = %key,
                    resource_id = %channel.resource_id,
                    ok,
                    notified,
                    "Channel ready"
                );
                let failed = result.as_ref().err().copied();
                channel.cached_result = Some(result);

                // A failed start never becomes usable; free the resource id
                if let Some(error) = failed {
                    warn!(target: "lw.pool", channel = %key, error = error.as_str(), "Channel failed to start");
                    self.evict(key, EvictReason::Failed);
                    self.compact();
                }
            }
            ChannelStatus::Working | ChannelStatus::Stopped => {
                warn!(
                    target: "lw.pool",
                    channel = %key,
                    status = channel.status.as_str(),
                    "Duplicate completion ignored"
                );
            }
        }
    }

    /// Evict idle live channels beyond the remaining budget, then drop
    /// finished ones.
    pub fn rebalance(&mut self) {
        let budget = self.max_parallel.saturating_sub(self.active_count());

        let mut idle_live = 0usize;
        let mut victims = Vec::new();
        for key in &self.order {
            let Some(channel) = self.channels.get(key) else {
                continue;
            };
            if !channel.is_idle() || !channel.status.is_live() {
                continue;
            }
            idle_live += 1;
            if idle_live > budget {
                victims.push(*key);
            }
        }

        for key in victims {
            self.evict(key, EvictReason::Capacity);
        }
        self.compact();
    }

    /// Move a live channel toward `Stopped` and release its engine handle.
    fn evict(&mut self, key: ChannelKey, reason: EvictReason) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        if !channel.status.is_live() {
            return;
        }

        let previous = channel.status;
        channel.status = ChannelStatus::Cancelling;
        let aborted = channel.flush(&Err(ChannelError::Aborted));
        if self.index.get(&channel.resource_id) == Some(&key) {
            self.index.remove(&channel.resource_id);
        }

        let outcome = match channel.engine_handle.take() {
            Some(handle) => self.driver.stop(handle, &self.events),
            None => StopOutcome::Released,
        };
        if previous == ChannelStatus::Working || outcome == StopOutcome::Released {
            channel.status = ChannelStatus::Stopped;
        }

        metrics::record_eviction(reason.as_str());
        info!(
            target: "lw.pool",
            channel = %key,
            resource_id = %channel.resource_id,
            reason = reason.as_str(),
            refs = channel.reference_count,
            aborted,
            status = channel.status.as_str(),
            "Channel evicted"
        );
    }

    /// Remove idle `Stopped` channels.
    fn compact(&mut self) {
        let finished: Vec<ChannelKey> = self
            .channels
            .values()
            .filter(|c| c.is_idle() && c.status == ChannelStatus::Stopped)
            .map(|c| c.key)
            .collect();
        if finished.is_empty() {
            return;
        }

        for key in &finished {
            self.channels.remove(key);
            trace!(target: "lw.pool", channel = %key, "Channel removed");
        }
        self.order.retain(|k| self.channels.contains_key(k));
    }

    /// One health/expiry tick.
    pub fn sweep(&mut self) {
        let mut failures: Vec<ChannelFailure> = Vec::new();
        self.driver.check_channels(&mut failures);

        for failure in failures {
            let Some(channel) = self.channels.get_mut(&failure.key) else {
                continue;
            };
            if !channel.status.is_live() {
                continue;
            }
            let notified = channel.flush(&Err(failure.error));
            warn!(
                target: "lw.pool",
                channel = %failure.key,
                resource_id = %channel.resource_id,
                error = failure.error.as_str(),
                notified,
                "Channel failed"
            );
            self.evict(failure.key, EvictReason::Failed);
        }

        let expired: Vec<ChannelKey> = self
            .channels
            .values_mut()
            .filter(|c| c.is_idle() && c.status.is_live())
            .filter_map(|c| c.tick_expiry().then_some(c.key))
            .collect();
        for key in expired {
            self.evict(key, EvictReason::Expired);
        }

        self.compact();
        self.publish_gauges();

        if tracing::enabled!(target: "lw.pool", tracing::Level::TRACE) {
            for snapshot in self.dump_channels() {
                trace!(
                    target: "lw.pool",
                    channel = %snapshot.key,
                    resource_id = %snapshot.resource_id,
                    status = snapshot.status.as_str(),
                    refs = snapshot.reference_count,
                    expire = snapshot.expire_countdown,
                    stats = ?snapshot.stats,
                    "Channel stats"
                );
            }
        }
    }

    fn publish_gauges(&self) {
        metrics::set_pool_channels(self.active_count(), self.channels.len());
    }

    /// Change the admission limit. Lowering it evicts immediately.
    pub fn set_max_parallel(&mut self, max_parallel: usize) {
        let decreased = max_parallel < self.max_parallel;
        info!(
            target: "lw.pool",
            from = self.max_parallel,
            to = max_parallel,
            "Admission limit changed"
        );
        self.max_parallel = max_parallel;
        if decreased {
            self.rebalance();
        }
    }

    /// Evict everything, abort every pending subscriber and stop the driver.
    pub fn shutdown(&mut self) {
        let keys: Vec<ChannelKey> = self.order.iter().copied().collect();
        for key in keys {
            self.evict(key, EvictReason::Shutdown);
        }
        self.driver.shutdown();

        for channel in self.channels.values_mut() {
            channel.flush(&Err(ChannelError::Aborted));
        }
        info!(
            target: "lw.pool",
            channels = self.channels.len(),
            driver = self.driver.name(),
            "Pool shut down"
        );
        self.channels.clear();
        self.index.clear();
        self.order.clear();
        self.publish_gauges();
    }

    /// Snapshot of every tracked channel, in eviction order.
    #[must_use]
    pub fn dump_channels(&self) -> Vec<ChannelSnapshot> {
        self.order
            .iter()
            .filter_map(|key| self.channels.get(key))
            .map(|channel| {
                let stats = channel
                    .engine_handle
                    .as_ref()
                    .and_then(|handle| self.driver.status(handle));
                channel.snapshot(stats)
            })
            .collect()
    }

    /// Snapshot of the live channel for `resource_id`, if any.
    #[must_use]
    pub fn lookup(&self, resource_id: &str) -> Option<ChannelSnapshot> {
        let channel = self.channels.get(self.index.get(resource_id)?)?;
        let stats = channel
            .engine_handle
            .as_ref()
            .and_then(|handle| self.driver.status(handle));
        Some(channel.snapshot(stats))
    }

    /// Live channels with at least one subscriber.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| !c.is_idle() && c.status.is_live())
            .count()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let active = self.active_count();
        let idle = self
            .channels
            .values()
            .filter(|c| c.is_idle() && c.status.is_live())
            .count();
        PoolStatus {
            channels: self.channels.len(),
            active,
            idle,
            max_parallel: self.max_parallel,
        }
    }

    #[must_use]
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{ChannelStats, DriverHandle};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Token codec where the token is the resource id behind a slash.
    struct PlainCodec;

    impl TokenCodec for PlainCodec {
        fn decode(&self, token: &str) -> Option<String> {
            token
                .strip_prefix('/')
                .filter(|rid| !rid.is_empty())
                .map(str::to_string)
        }
    }

    #[derive(Default)]
    struct DriverState {
        refuse: bool,
        defer_aborts: bool,
        started: Vec<StartRequest>,
        stopped: Vec<ChannelKey>,
        completed: HashSet<ChannelKey>,
        failures: Vec<ChannelFailure>,
    }

    /// Driver whose completions are injected by the test.
    #[derive(Clone, Default)]
    struct FakeDriver(Arc<Mutex<DriverState>>);

    impl ChannelDriver for FakeDriver {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn start(&mut self, request: &StartRequest, _events: &DriverEventSink) -> Option<DriverHandle> {
            let mut state = self.0.lock().unwrap();
            if state.refuse {
                return None;
            }
            state.started.push(request.clone());
            Some(DriverHandle::new(request.key))
        }

        fn stop(&mut self, handle: DriverHandle, events: &DriverEventSink) -> StopOutcome {
            let mut state = self.0.lock().unwrap();
            let key = handle.key();
            state.stopped.push(key);
            if state.defer_aborts && state.completed.insert(key) {
                events.post(DriverEvent::Finished {
                    key,
                    result: Err(ChannelError::Aborted),
                });
                return StopOutcome::CompletionPending;
            }
            state.completed.insert(key);
            StopOutcome::Released
        }

        fn resolve(&mut self, event: DriverEvent) -> Option<(ChannelKey, ChannelResult)> {
            let mut state = self.0.lock().unwrap();
            match event {
                DriverEvent::EngineSignal { key, ready } => {
                    if !state.completed.insert(key) {
                        return None;
                    }
                    if ready {
                        Some((key, Ok(format!("http://127.0.0.1:{}/1.asf", 9100 + key.0))))
                    } else {
                        Some((key, Err(ChannelError::EngineFailure)))
                    }
                }
                DriverEvent::Finished { key, result } => Some((key, result)),
                DriverEvent::WorkerReport { .. } => None,
            }
        }

        fn check_channels(&mut self, failures: &mut Vec<ChannelFailure>) {
            failures.append(&mut self.0.lock().unwrap().failures);
        }

        fn status(&self, handle: &DriverHandle) -> Option<ChannelStats> {
            Some(ChannelStats {
                media_port: 9100 + u16::try_from(handle.key().0).unwrap(),
                ..ChannelStats::default()
            })
        }

        fn shutdown(&mut self) {}
    }

    struct Harness {
        pool: ChannelPool,
        events: mpsc::UnboundedReceiver<DriverEvent>,
        driver: FakeDriver,
    }

    impl Harness {
        fn new(max_parallel: usize) -> Self {
            let driver = FakeDriver::default();
            let settings = PoolSettings {
                max_parallel,
                ..PoolSettings::default()
            };
            let (pool, events) =
                ChannelPool::new(Box::new(driver.clone()), Arc::new(PlainCodec), &settings);
            Self {
                pool,
                events,
                driver,
            }
        }

        fn start(&mut self, rid: &str) -> Subscription {
            self.pool.start_channel(&format!("/{rid}"), PortHints::default())
        }

        fn signal(&mut self, key: ChannelKey, ready: bool) {
            self.pool
                .on_driver_event(DriverEvent::EngineSignal { key, ready });
        }

        /// Feed queued driver events back into the pool.
        fn drain_events(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.pool.on_driver_event(event);
            }
        }

        fn snapshot(&self, rid: &str) -> ChannelSnapshot {
            self.pool.lookup(rid).expect("channel should be live")
        }

        fn starts(&self) -> usize {
            self.driver.0.lock().unwrap().started.len()
        }

        fn stopped(&self) -> Vec<ChannelKey> {
            self.driver.0.lock().unwrap().stopped.clone()
        }
    }

    #[test]
    fn test_invalid_token_returns_null_handle() {
        let mut h = Harness::new(1);
        let mut sub = h.pool.start_channel("/", PortHints::default());

        assert!(sub.handle.is_null());
        assert_eq!(sub.completion.try_recv(), Some(Err(ChannelError::InvalidRequest)));
        assert_eq!(h.starts(), 0);
        assert!(h.pool.dump_channels().is_empty());
    }

    #[test]
    fn test_engine_refusal_inserts_nothing() {
        let mut h = Harness::new(1);
        h.driver.0.lock().unwrap().refuse = true;

        let mut sub = h.start("abc");
        assert!(sub.handle.is_null());
        assert_eq!(
            sub.completion.try_recv(),
            Some(Err(ChannelError::EngineUnavailable))
        );
        assert!(h.pool.lookup("abc").is_none());
    }

    #[test]
    fn test_subscribers_share_channel_and_complete_in_order() {
        let mut h = Harness::new(1);
        let mut a = h.start("abc");
        let mut b = h.start("abc");

        assert_eq!(h.starts(), 1, "Second start joins the existing channel");
        assert_eq!(a.handle.channel(), b.handle.channel());
        assert_eq!(a.handle.cancel_token(), 1);
        assert_eq!(b.handle.cancel_token(), 2);
        assert_eq!(h.snapshot("abc").reference_count, 2);
        assert_eq!(a.completion.try_recv(), None);

        h.signal(a.handle.channel().unwrap(), true);
        let url = "http://127.0.0.1:9101/1.asf".to_string();
        assert_eq!(a.completion.try_recv(), Some(Ok(url.clone())));
        assert_eq!(b.completion.try_recv(), Some(Ok(url.clone())));

        // Late joiner gets the cached result straight away
        let mut c = h.start("abc");
        assert_eq!(c.handle.cancel_token(), 0);
        assert_eq!(c.completion.try_recv(), Some(Ok(url)));
        assert_eq!(h.snapshot("abc").status, ChannelStatus::Working);
    }

    #[test]
    fn test_capacity_evicts_idle_before_active() {
        // max_parallel = 1: X has three subscribers, Y is admitted anyway
        let mut h = Harness::new(1);
        let mut x: Vec<Subscription> = (0..3).map(|_| h.start("x")).collect();
        let mut y = h.start("y");

        assert_eq!(h.pool.active_count(), 2);
        assert!(h.stopped().is_empty());

        for sub in &mut x {
            h.pool.stop_channel(&mut sub.handle);
        }

        // X went idle while Y is active: budget is 0 so X is evicted
        assert!(h.pool.lookup("x").is_none());
        assert_eq!(h.stopped(), vec![ChannelKey(1)]);
        assert_eq!(h.snapshot("y").reference_count, 1);
        assert!(y.completion.try_recv().is_none());
    }

    #[test]
    fn test_idle_channel_kept_within_budget() {
        let mut h = Harness::new(1);
        let mut x = h.start("x");
        h.pool.stop_channel(&mut x.handle);

        let snapshot = h.snapshot("x");
        assert_eq!(snapshot.reference_count, 0);
        assert_eq!(snapshot.expire_countdown, 10);
        assert!(h.stopped().is_empty());

        // An active channel uses up the budget
        let mut y = h.start("y");
        assert!(h.pool.lookup("x").is_none());
        h.pool.stop_channel(&mut y.handle);
        assert!(h.pool.lookup("x").is_none());
        assert!(h.pool.lookup("y").is_some());
    }

    #[test]
    fn test_stop_before_engine_responds() {
        let mut h = Harness::new(1);
        let mut sub = h.start("x");
        let key = sub.handle.channel().unwrap();

        h.pool.stop_channel(&mut sub.handle);
        assert_eq!(sub.completion.try_recv(), Some(Err(ChannelError::Aborted)));

        let snapshot = h.snapshot("x");
        assert_eq!(snapshot.status, ChannelStatus::Started);
        assert_eq!(snapshot.reference_count, 0);
        assert_eq!(snapshot.expire_countdown, 10);

        // The engine answering later still makes the channel usable
        h.signal(key, true);
        assert_eq!(h.snapshot("x").status, ChannelStatus::Working);
    }

    #[test]
    fn test_second_stop_is_noop() {
        let mut h = Harness::new(2);
        let mut a = h.start("x");
        let _b = h.start("x");

        h.pool.stop_channel(&mut a.handle);
        assert!(a.handle.is_null());
        h.pool.stop_channel(&mut a.handle);

        assert_eq!(h.snapshot("x").reference_count, 1);
    }

    #[test]
    fn test_stop_only_cancels_own_slot() {
        let mut h = Harness::new(1);
        let mut a = h.start("x");
        let mut b = h.start("x");

        h.pool.stop_channel(&mut b.handle);
        assert_eq!(b.completion.try_recv(), Some(Err(ChannelError::Aborted)));
        assert_eq!(a.completion.try_recv(), None);

        h.signal(a.handle.channel().unwrap(), true);
        assert!(matches!(a.completion.try_recv(), Some(Ok(_))));
    }

    #[test]
    fn test_engine_failure_reaches_all_pending_and_frees_resource_id() {
        let mut h = Harness::new(1);
        let mut a = h.start("r1");
        let mut b = h.start("r1");
        let key = a.handle.channel().unwrap();

        h.signal(key, false);
        assert_eq!(a.completion.try_recv(), Some(Err(ChannelError::EngineFailure)));
        assert_eq!(b.completion.try_recv(), Some(Err(ChannelError::EngineFailure)));
        assert!(h.pool.lookup("r1").is_none());
        assert_eq!(h.stopped(), vec![key]);

        let c = h.start("r1");
        assert_ne!(c.handle.channel(), Some(key));
        assert_eq!(h.starts(), 2);
    }

    #[test]
    fn test_health_check_failure_evicts_working_channel() {
        let mut h = Harness::new(1);
        let mut a = h.start("r1");
        let key = a.handle.channel().unwrap();
        h.driver.0.lock().unwrap().failures.push(ChannelFailure {
            key,
            error: ChannelError::EngineFailure,
        });

        h.pool.sweep();
        assert_eq!(a.completion.try_recv(), Some(Err(ChannelError::EngineFailure)));
        assert!(h.pool.lookup("r1").is_none());

        // Subscriber still holds a reference until it stops
        assert_eq!(h.pool.dump_channels().len(), 1);
        h.pool.stop_channel(&mut a.handle);
        assert!(h.pool.dump_channels().is_empty());
    }

    #[test]
    fn test_idle_channel_expires_after_grace_ticks() {
        let mut h = Harness::new(4);
        let mut sub = h.start("x");
        h.signal(sub.handle.channel().unwrap(), true);
        h.pool.stop_channel(&mut sub.handle);

        for _ in 0..9 {
            h.pool.sweep();
        }
        assert_eq!(h.snapshot("x").expire_countdown, 1);

        h.pool.sweep();
        assert!(h.pool.lookup("x").is_none());
        assert!(h.pool.dump_channels().is_empty());
    }

    #[test]
    fn test_new_subscriber_resets_expiry() {
        let mut h = Harness::new(4);
        let mut a = h.start("x");
        h.pool.stop_channel(&mut a.handle);
        h.pool.sweep();
        h.pool.sweep();

        let _b = h.start("x");
        assert_eq!(h.snapshot("x").expire_countdown, 0);
        for _ in 0..20 {
            h.pool.sweep();
        }
        assert!(h.pool.lookup("x").is_some(), "Active channels never expire");
    }

    #[test]
    fn test_reconnect_with_new_hints_replaces_channel() {
        let mut h = Harness::new(4);
        let mut first = h
            .pool
            .start_channel("/x", PortHints::new(8001, 8002));
        let old = first.handle.channel().unwrap();

        // Same hints join
        let same = h.pool.start_channel("/x", PortHints::new(8001, 8002));
        assert_eq!(same.handle.channel(), Some(old));

        // Partial hints never trigger a reconnect
        let partial = h.pool.start_channel("/x", PortHints::new(9001, 0));
        assert_eq!(partial.handle.channel(), Some(old));

        let second = h.pool.start_channel("/x", PortHints::new(9001, 9002));
        let new = second.handle.channel().unwrap();
        assert_ne!(new, old);
        assert_eq!(first.completion.try_recv(), Some(Err(ChannelError::Aborted)));

        let live: Vec<_> = h
            .pool
            .dump_channels()
            .into_iter()
            .filter(|s| s.resource_id == "x" && s.status.is_live())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, new);
        assert_eq!(live[0].hints, PortHints::new(9001, 9002));
    }

    #[test]
    fn test_set_max_parallel_decrease_evicts_idle() {
        let mut h = Harness::new(3);
        for rid in ["a", "b", "c"] {
            let mut sub = h.start(rid);
            h.pool.stop_channel(&mut sub.handle);
        }
        assert_eq!(h.pool.status().idle, 3);

        h.pool.set_max_parallel(1);
        assert_eq!(h.pool.status().idle, 1);
        assert_eq!(h.pool.max_parallel(), 1);
        // Least recently idled go first; the front survives
        assert!(h.pool.lookup("c").is_some());
        assert!(h.pool.lookup("a").is_none());
        assert!(h.pool.lookup("b").is_none());
    }

    #[test]
    fn test_deferred_abort_finalizes_on_completion() {
        let mut h = Harness::new(0);
        h.driver.0.lock().unwrap().defer_aborts = true;

        let mut sub = h.start("x");
        let key = sub.handle.channel().unwrap();
        h.pool.stop_channel(&mut sub.handle);

        // Evicted while Started; waiting for the driver's final completion
        let snapshot = &h.pool.dump_channels()[0];
        assert_eq!(snapshot.status, ChannelStatus::Cancelling);

        h.drain_events();
        assert!(h.pool.dump_channels().is_empty());

        // The engine's own answer arriving afterwards is discarded
        h.signal(key, true);
        assert!(h.pool.dump_channels().is_empty());
    }

    #[test]
    fn test_exactly_one_completion_under_eviction() {
        let mut h = Harness::new(1);
        let mut a = h.start("x");
        let key = a.handle.channel().unwrap();
        let mut b = h.start("x");

        h.pool.stop_channel(&mut b.handle);
        h.pool.set_max_parallel(0);
        h.pool.stop_channel(&mut a.handle);
        h.signal(key, true);
        h.signal(key, false);

        assert_eq!(a.completion.try_recv(), Some(Err(ChannelError::Aborted)));
        assert_eq!(b.completion.try_recv(), Some(Err(ChannelError::Aborted)));
    }

    #[test]
    fn test_completion_for_unknown_key_ignored() {
        let mut h = Harness::new(1);
        h.pool.on_driver_event(DriverEvent::Finished {
            key: ChannelKey(42),
            result: Ok("late".to_string()),
        });
        assert!(h.pool.dump_channels().is_empty());
    }

    #[test]
    fn test_shutdown_aborts_pending() {
        let mut h = Harness::new(4);
        let mut a = h.start("x");
        let mut b = h.start("y");

        h.pool.shutdown();
        assert_eq!(a.completion.try_recv(), Some(Err(ChannelError::Aborted)));
        assert_eq!(b.completion.try_recv(), Some(Err(ChannelError::Aborted)));
        assert!(h.pool.dump_channels().is_empty());

        // Handles outliving the pool state are harmless
        h.pool.stop_channel(&mut a.handle);
    }

    #[test]
    fn test_dump_includes_driver_stats() {
        let mut h = Harness::new(1);
        let _sub = h.start("x");

        let dump = h.pool.dump_channels();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].resource_id, "x");
        assert_eq!(dump[0].stats.map(|s| s.media_port), Some(9101));
        assert_eq!(
            h.pool.status(),
            PoolStatus {
                channels: 1,
                active: 1,
                idle: 0,
                max_parallel: 1,
            }
        );
    }
}
