//! Loopback engine for development and worker processes.
//!
//! Allocates a local media port per handle and reports readiness after a
//! fixed delay. No media is actually served.

use super::{ChannelStats, CompletionCallback, NativeEngine, NativeHandle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

/// First media port handed out.
pub const DEFAULT_BASE_PORT: u16 = 9100;

/// Ports are recycled within this window above the base.
const PORT_RANGE: u64 = 1000;

#[derive(Debug)]
struct LoopbackChannel {
    media_port: u16,
    started_at: Instant,
    timer: Option<JoinHandle<()>>,
}

/// [`NativeEngine`] that becomes ready after `ready_delay`.
#[derive(Debug)]
pub struct LoopbackEngine {
    ready_delay: Duration,
    base_port: u16,
    capacity: Option<usize>,
    next_id: u64,
    channels: HashMap<NativeHandle, LoopbackChannel>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(ready_delay: Duration) -> Self {
        Self {
            ready_delay,
            base_port: DEFAULT_BASE_PORT,
            capacity: None,
            next_id: 0,
            channels: HashMap::new(),
        }
    }

    /// Refuse starts once `capacity` channels are live.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.channels.len()
    }
}

impl NativeEngine for LoopbackEngine {
    fn start(&mut self, _uri: &str, tcp_port: u16, udp_port: u16) -> Option<NativeHandle> {
        if self.capacity.is_some_and(|cap| self.channels.len() >= cap) {
            debug!(
                target: "lw.engine.loopback",
                live = self.channels.len(),
                "Capacity reached, refusing start"
            );
            return None;
        }

        self.next_id += 1;
        let handle = NativeHandle(self.next_id);
        let offset = u16::try_from(self.next_id % PORT_RANGE).unwrap_or(0);
        let media_port = self.base_port.saturating_add(offset);

        debug!(
            target: "lw.engine.loopback",
            handle = handle.0,
            tcp_port,
            udp_port,
            media_port,
            "Channel allocated"
        );

        self.channels.insert(
            handle,
            LoopbackChannel {
                media_port,
                started_at: Instant::now(),
                timer: None,
            },
        );
        Some(handle)
    }

    fn stop(&mut self, handle: NativeHandle) {
        if let Some(channel) = self.channels.remove(&handle) {
            if let Some(timer) = channel.timer {
                timer.abort();
            }
            debug!(
                target: "lw.engine.loopback",
                handle = handle.0,
                media_port = channel.media_port,
                "Channel released"
            );
        }
    }

    fn get_status(&self, handle: NativeHandle) -> Option<ChannelStats> {
        let channel = self.channels.get(&handle)?;
        let elapsed = channel.started_at.elapsed();
        let delay_ms = self.ready_delay.as_millis().max(1);
        let buffer_percent = (elapsed.as_millis() * 100 / delay_ms).min(100);

        Some(ChannelStats {
            media_port: channel.media_port,
            buffer_percent: u32::try_from(buffer_percent).unwrap_or(100),
            buffer_time_ms: u32::try_from(elapsed.as_millis().min(30_000)).unwrap_or(0),
            download_speed: 0,
            upload_speed: 0,
            connection_count: 0,
            pending_peer_count: 0,
            total_peer_count: 0,
        })
    }

    fn set_completion_callback(&mut self, handle: NativeHandle, callback: CompletionCallback) {
        let Some(channel) = self.channels.get_mut(&handle) else {
            return;
        };

        // Readiness needs a timer; without a runtime the channel can never come up
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            callback(false);
            return;
        };

        let delay = self.ready_delay;
        channel.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback(true);
        }));
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        for channel in self.channels.values_mut() {
            if let Some(timer) = channel.timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, CompletionCallback) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        (
            fired,
            Box::new(move |ready| sink.lock().unwrap().push(ready)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_delay() {
        let mut engine = LoopbackEngine::new(Duration::from_millis(200));
        let handle = engine.start("synacast://abc", 0, 0).unwrap();
        let (fired, callback) = recorder();
        engine.set_completion_callback(handle, callback);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec![true]);

        let stats = engine.get_status(handle).unwrap();
        assert_eq!(stats.media_port, DEFAULT_BASE_PORT + 1);
        assert_eq!(stats.buffer_percent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_callback() {
        let mut engine = LoopbackEngine::new(Duration::from_millis(200));
        let handle = engine.start("synacast://abc", 0, 0).unwrap();
        let (fired, callback) = recorder();
        engine.set_completion_callback(handle, callback);

        engine.stop(handle);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(fired.lock().unwrap().is_empty());
        assert!(engine.get_status(handle).is_none());
    }

    #[test]
    fn test_capacity_refuses_starts() {
        let mut engine = LoopbackEngine::new(Duration::ZERO)
            .with_capacity(1)
            .with_base_port(20000);
        let first = engine.start("synacast://a", 0, 0).unwrap();

        assert!(engine.start("synacast://b", 0, 0).is_none());
        assert_eq!(engine.get_status(first).unwrap().media_port, 20001);

        engine.stop(first);
        assert!(engine.start("synacast://b", 0, 0).is_some());
    }

    #[test]
    fn test_callback_without_runtime_reports_failure() {
        let mut engine = LoopbackEngine::new(Duration::ZERO);
        let handle = engine.start("synacast://abc", 0, 0).unwrap();
        let (fired, callback) = recorder();

        engine.set_completion_callback(handle, callback);
        assert_eq!(*fired.lock().unwrap(), vec![false]);
    }
}
