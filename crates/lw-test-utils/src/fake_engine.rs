//! Scripted engine for pool tests.
//!
//! `FakeEngine` records every call and holds readiness callbacks until the
//! test fires them with [`FakeEngine::complete`]. Clones share state, so keep
//! one clone in the test and hand the other to the driver.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = FakeEngine::new();
//! let driver = fake_driver(&engine);
//! // ... start a channel through the pool ...
//! let handle = engine.handle_for_resource("abc").unwrap();
//! engine.complete(handle, true);
//! ```

use live_worker::engine::{
    ChannelDriver, ChannelStats, CompletionCallback, InProcessDriver, NativeEngine, NativeHandle,
};
use live_worker::token::engine_uri;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Media ports handed out by the fake start here.
pub const FAKE_BASE_PORT: u16 = 20_000;

#[derive(Default)]
struct FakeEngineInner {
    next_handle: u64,
    refuse_starts: bool,
    capacity: Option<usize>,
    /// Live handles and the URI each was started with.
    live: BTreeMap<u64, String>,
    /// Handles the engine no longer reports status for.
    failed: Vec<u64>,
    callbacks: HashMap<u64, CompletionCallback>,
    started: Vec<StartCall>,
    stopped: Vec<NativeHandle>,
}

/// One recorded `start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub handle: Option<NativeHandle>,
    pub uri: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// Fake engine with test-controlled readiness.
#[derive(Clone, Default)]
pub struct FakeEngine {
    inner: Arc<Mutex<FakeEngineInner>>,
}

impl std::fmt::Debug for FakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FakeEngine")
            .field("live", &inner.live)
            .field("pending_callbacks", &inner.callbacks.len())
            .field("stopped", &inner.stopped)
            .finish_non_exhaustive()
    }
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeEngineInner> {
        self.inner.lock().expect("fake engine lock poisoned")
    }

    /// Make every following `start` fail (or succeed again).
    pub fn refuse_starts(&self, refuse: bool) {
        self.lock().refuse_starts = refuse;
    }

    /// Refuse starts once `capacity` handles are live.
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.lock().capacity = Some(capacity);
        self
    }

    /// Fire the readiness callback for `handle`. Returns `false` if there
    /// was no callback left to fire.
    pub fn complete(&self, handle: NativeHandle, ready: bool) -> bool {
        // Run the callback outside the lock
        let callback = self.lock().callbacks.remove(&handle.0);
        match callback {
            Some(callback) => {
                callback(ready);
                true
            }
            None => false,
        }
    }

    /// Fire every outstanding callback. Returns how many fired.
    pub fn complete_all(&self, ready: bool) -> usize {
        let callbacks: Vec<CompletionCallback> =
            self.lock().callbacks.drain().map(|(_, cb)| cb).collect();
        let fired = callbacks.len();
        for callback in callbacks {
            callback(ready);
        }
        fired
    }

    /// Stop reporting status for `handle`, as a crashed engine channel would.
    pub fn fail(&self, handle: NativeHandle) {
        self.lock().failed.push(handle.0);
    }

    /// Most recent handle started for the given engine URI.
    #[must_use]
    pub fn handle_for_uri(&self, uri: &str) -> Option<NativeHandle> {
        self.lock()
            .started
            .iter()
            .rev()
            .find(|call| call.uri == uri)
            .and_then(|call| call.handle)
    }

    /// Most recent handle started for the token of `resource_id`, as built
    /// by [`token_for`](crate::fixtures::token_for).
    #[must_use]
    pub fn handle_for_resource(&self, resource_id: &str) -> Option<NativeHandle> {
        self.handle_for_uri(&engine_uri(&crate::fixtures::token_for(resource_id)))
    }

    #[must_use]
    pub fn started(&self) -> Vec<StartCall> {
        self.lock().started.clone()
    }

    #[must_use]
    pub fn start_count(&self) -> usize {
        self.lock().started.iter().filter(|c| c.handle.is_some()).count()
    }

    #[must_use]
    pub fn stopped(&self) -> Vec<NativeHandle> {
        self.lock().stopped.clone()
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.lock().stopped.len()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.lock().callbacks.len()
    }
}

impl NativeEngine for FakeEngine {
    fn start(&mut self, uri: &str, tcp_port: u16, udp_port: u16) -> Option<NativeHandle> {
        let mut inner = self.lock();
        let full = inner.capacity.is_some_and(|cap| inner.live.len() >= cap);
        let handle = if inner.refuse_starts || full {
            None
        } else {
            inner.next_handle += 1;
            let id = inner.next_handle;
            inner.live.insert(id, uri.to_string());
            Some(NativeHandle(id))
        };
        inner.started.push(StartCall {
            handle,
            uri: uri.to_string(),
            tcp_port,
            udp_port,
        });
        handle
    }

    fn stop(&mut self, handle: NativeHandle) {
        let mut inner = self.lock();
        inner.live.remove(&handle.0);
        inner.stopped.push(handle);
    }

    fn get_status(&self, handle: NativeHandle) -> Option<ChannelStats> {
        let inner = self.lock();
        if !inner.live.contains_key(&handle.0) || inner.failed.contains(&handle.0) {
            return None;
        }
        let offset = u16::try_from(handle.0 % 1000).unwrap_or(0);
        Some(ChannelStats {
            media_port: FAKE_BASE_PORT + offset,
            buffer_percent: 100,
            connection_count: 1,
            ..ChannelStats::default()
        })
    }

    fn set_completion_callback(&mut self, handle: NativeHandle, callback: CompletionCallback) {
        self.lock().callbacks.insert(handle.0, callback);
    }
}

/// In-process driver over a clone of `engine`.
#[must_use]
pub fn fake_driver(engine: &FakeEngine) -> Box<dyn ChannelDriver> {
    Box::new(InProcessDriver::new(engine.clone()))
}
