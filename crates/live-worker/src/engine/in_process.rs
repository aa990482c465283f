//! Driver that runs the native engine inside this process.

use super::{
    ChannelDriver, ChannelFailure, ChannelStats, DriverEvent, DriverEventSink, DriverHandle,
    NativeEngine, NativeHandle, StartRequest, StopOutcome,
};
use crate::errors::{ChannelError, ChannelResult};
use crate::pool::ChannelKey;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug)]
struct NativeChannel {
    handle: NativeHandle,
    completed: bool,
}

/// [`ChannelDriver`] over an in-process [`NativeEngine`].
///
/// Engine callbacks may fire on any thread; they only post an
/// [`DriverEvent::EngineSignal`] and the actual result is built in
/// [`resolve`](ChannelDriver::resolve) on the pool loop.
pub struct InProcessDriver<E: NativeEngine> {
    engine: E,
    channels: HashMap<ChannelKey, NativeChannel>,
}

impl<E: NativeEngine> InProcessDriver<E> {
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            channels: HashMap::new(),
        }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Number of engine handles currently held.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.channels.len()
    }
}

impl<E: NativeEngine> ChannelDriver for InProcessDriver<E> {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn start(&mut self, request: &StartRequest, events: &DriverEventSink) -> Option<DriverHandle> {
        let handle = self
            .engine
            .start(&request.uri, request.hints.tcp, request.hints.udp)?;

        let key = request.key;
        let sink = events.clone();
        self.engine.set_completion_callback(
            handle,
            Box::new(move |ready| {
                if !sink.post(DriverEvent::EngineSignal { key, ready }) {
                    debug!(target: "lw.driver.in_process", channel = %key, "Pool gone, dropping engine signal");
                }
            }),
        );

        self.channels.insert(
            key,
            NativeChannel {
                handle,
                completed: false,
            },
        );
        Some(DriverHandle::new(key))
    }

    fn stop(&mut self, handle: DriverHandle, _events: &DriverEventSink) -> StopOutcome {
        if let Some(channel) = self.channels.remove(&handle.key()) {
            self.engine.stop(channel.handle);
        }
        StopOutcome::Released
    }

    fn resolve(&mut self, event: DriverEvent) -> Option<(ChannelKey, ChannelResult)> {
        let DriverEvent::EngineSignal { key, ready } = event else {
            warn!(target: "lw.driver.in_process", channel = %event.key(), "Unexpected driver event");
            return None;
        };

        // Stopped handles and repeated signals are dropped here
        let channel = self.channels.get_mut(&key)?;
        if channel.completed {
            return None;
        }
        channel.completed = true;

        if !ready {
            return Some((key, Err(ChannelError::EngineFailure)));
        }

        let result = self
            .engine
            .get_status(channel.handle)
            .map(|stats| stats.playback_url())
            .ok_or(ChannelError::EngineFailure);
        Some((key, result))
    }

    fn check_channels(&mut self, failures: &mut Vec<ChannelFailure>) {
        for (key, channel) in &self.channels {
            if self.engine.get_status(channel.handle).is_none() {
                failures.push(ChannelFailure {
                    key: *key,
                    error: ChannelError::EngineFailure,
                });
            }
        }
    }

    fn status(&self, handle: &DriverHandle) -> Option<ChannelStats> {
        let channel = self.channels.get(&handle.key())?;
        self.engine.get_status(channel.handle)
    }

    fn shutdown(&mut self) {
        for (_, channel) in self.channels.drain() {
            self.engine.stop(channel.handle);
        }
    }
}
