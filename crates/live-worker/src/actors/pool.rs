//! `PoolActor` - the single task that owns the channel pool.
//!
//! Three inputs feed one `select!` loop:
//!
//! - `PoolMessage`s from [`PoolActorHandle`] clones (gateway, admin, `main`);
//! - `DriverEvent`s posted by engine callbacks and worker report readers;
//! - the sweeper timer, re-armed after every sweep.
//!
//! # Graceful Shutdown
//!
//! `shutdown()` (or cancelling the token) evicts every channel, resolves all
//! pending subscribers with `Aborted` and stops the driver before the task
//! exits. Handle calls made afterwards fail with `LwError::Internal`.

use super::messages::PoolMessage;
use super::metrics::ActorMetrics;
use crate::engine::{ChannelDriver, DriverEvent};
use crate::errors::LwError;
use crate::pool::{
    ChannelHandle, ChannelPool, ChannelSnapshot, PoolSettings, PoolStatus, PortHints,
    Subscription,
};
use crate::token::TokenCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the pool mailbox.
const POOL_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `PoolActor`.
///
/// Cheap to clone. All methods go through the actor's mailbox and return
/// once the pool has applied the request.
#[derive(Clone)]
pub struct PoolActorHandle {
    sender: mpsc::Sender<PoolMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
}

impl PoolActorHandle {
    /// Spawn the pool actor on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Runtime` if called outside a tokio runtime; the
    /// sweeper and the engines need its timer.
    pub fn spawn(
        driver: Box<dyn ChannelDriver>,
        codec: Arc<dyn TokenCodec>,
        settings: &PoolSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Result<Self, LwError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LwError::Runtime(format!("pool actor needs a tokio runtime: {e}")))?;

        let (sender, receiver) = mpsc::channel(POOL_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let (pool, events) = ChannelPool::new(driver, codec, settings);

        let actor = PoolActor {
            pool,
            receiver,
            events,
            cancel_token: cancel_token.clone(),
            sweep_interval: settings.sweep_interval,
            metrics: Arc::clone(&metrics),
        };
        runtime.spawn(actor.run());

        Ok(Self {
            sender,
            cancel_token,
            metrics,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolMessage,
    ) -> Result<T, LwError> {
        let (tx, rx) = oneshot::channel();
        self.metrics.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.metrics.mailbox.record_send_failed();
            return Err(LwError::Internal(format!("channel send failed: {e}")));
        }

        rx.await
            .map_err(|e| LwError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to the channel behind `token`.
    ///
    /// Channel-level failures arrive on the subscription's completion, not
    /// as an `Err` here.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn start_channel(
        &self,
        token: impl Into<String>,
        hints: PortHints,
    ) -> Result<Subscription, LwError> {
        let token = token.into();
        self.request(|respond_to| PoolMessage::StartChannel {
            token,
            hints,
            respond_to,
        })
        .await
    }

    /// Release a subscription. The handle is left null, so repeating the
    /// call does nothing.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn stop_channel(&self, handle: &mut ChannelHandle) -> Result<(), LwError> {
        let handle = handle.take();
        if handle.is_null() {
            return Ok(());
        }
        self.request(|respond_to| PoolMessage::StopChannel { handle, respond_to })
            .await
    }

    /// Release a subscription from synchronous code, such as a `Drop` impl.
    pub fn release(&self, handle: ChannelHandle) {
        if handle.is_null() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "lw.actor.pool", "No runtime to release channel handle on");
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            let mut handle = handle;
            if let Err(e) = this.stop_channel(&mut handle).await {
                debug!(target: "lw.actor.pool", error = %e, "Release after pool stopped");
            }
        });
    }

    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn set_max_parallel(&self, max_parallel: usize) -> Result<(), LwError> {
        self.request(|respond_to| PoolMessage::SetMaxParallel {
            max_parallel,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn dump_channels(&self) -> Result<Vec<ChannelSnapshot>, LwError> {
        self.request(|respond_to| PoolMessage::DumpChannels { respond_to })
            .await
    }

    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn lookup(
        &self,
        resource_id: impl Into<String>,
    ) -> Result<Option<ChannelSnapshot>, LwError> {
        let resource_id = resource_id.into();
        self.request(|respond_to| PoolMessage::Lookup {
            resource_id,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor has stopped.
    pub async fn status(&self) -> Result<PoolStatus, LwError> {
        self.request(|respond_to| PoolMessage::GetStatus { respond_to })
            .await
    }

    /// Evict everything and stop the actor. Returns once pending subscribers
    /// have been resolved.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Internal` if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<(), LwError> {
        self.request(|respond_to| PoolMessage::Shutdown { respond_to })
            .await
    }

    /// Cancel the actor without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }
}

/// The actor itself. Only reachable through [`PoolActorHandle::spawn`].
pub struct PoolActor {
    pool: ChannelPool,
    receiver: mpsc::Receiver<PoolMessage>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    cancel_token: CancellationToken,
    sweep_interval: Duration,
    metrics: Arc<ActorMetrics>,
}

impl PoolActor {
    #[instrument(skip_all, name = "lw.actor.pool")]
    async fn run(mut self) {
        info!(
            target: "lw.actor.pool",
            max_parallel = self.pool.max_parallel(),
            sweep_ms = u64::try_from(self.sweep_interval.as_millis()).unwrap_or(u64::MAX),
            "PoolActor started"
        );

        let sweep = tokio::time::sleep(self.sweep_interval);
        tokio::pin!(sweep);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "lw.actor.pool", "PoolActor received cancellation signal");
                    self.pool.shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        info!(target: "lw.actor.pool", "PoolActor channel closed, exiting");
                        self.pool.shutdown();
                        break;
                    };
                    self.metrics.mailbox.record_dequeue();
                    let stop = self.handle_message(message);
                    self.metrics.record_message_processed();
                    if stop {
                        break;
                    }
                }

                Some(event) = self.events.recv() => {
                    self.metrics.record_driver_event();
                    self.pool.on_driver_event(event);
                }

                () = &mut sweep => {
                    self.pool.sweep();
                    self.metrics.record_sweep();
                    sweep.as_mut().reset(tokio::time::Instant::now() + self.sweep_interval);
                }
            }
        }

        info!(
            target: "lw.actor.pool",
            messages_processed = self.metrics.messages_processed(),
            driver_events = self.metrics.driver_events(),
            sweeps = self.metrics.sweeps(),
            "PoolActor stopped"
        );
    }

    /// Apply one message. Returns `true` when the actor should exit.
    fn handle_message(&mut self, message: PoolMessage) -> bool {
        match message {
            PoolMessage::StartChannel {
                token,
                hints,
                respond_to,
            } => {
                let subscription = self.pool.start_channel(&token, hints);
                if let Err(subscription) = respond_to.send(subscription) {
                    // Caller went away before seeing its handle
                    let (mut handle, _) = subscription.into_parts();
                    self.pool.stop_channel(&mut handle);
                }
            }
            PoolMessage::StopChannel { mut handle, respond_to } => {
                self.pool.stop_channel(&mut handle);
                let _ = respond_to.send(());
            }
            PoolMessage::SetMaxParallel {
                max_parallel,
                respond_to,
            } => {
                self.pool.set_max_parallel(max_parallel);
                let _ = respond_to.send(());
            }
            PoolMessage::DumpChannels { respond_to } => {
                let _ = respond_to.send(self.pool.dump_channels());
            }
            PoolMessage::Lookup {
                resource_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.pool.lookup(&resource_id));
            }
            PoolMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.pool.status());
            }
            PoolMessage::Shutdown { respond_to } => {
                info!(target: "lw.actor.pool", "PoolActor shutting down");
                self.pool.shutdown();
                self.cancel_token.cancel();
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{InProcessDriver, LoopbackEngine};
    use crate::errors::ChannelError;
    use crate::pool::ChannelStatus;
    use crate::token::KeyedTokenCodec;
    use common::secret::SecretString;

    fn codec() -> Arc<KeyedTokenCodec> {
        Arc::new(KeyedTokenCodec::new(&SecretString::from("pool-actor-test-key")))
    }

    fn spawn_pool(ready_delay: Duration, max_parallel: usize) -> (PoolActorHandle, Arc<KeyedTokenCodec>) {
        let codec = codec();
        let settings = PoolSettings {
            max_parallel,
            ..PoolSettings::default()
        };
        let driver = InProcessDriver::new(LoopbackEngine::new(ready_delay));
        let handle = PoolActorHandle::spawn(
            Box::new(driver),
            Arc::clone(&codec) as Arc<dyn TokenCodec>,
            &settings,
            ActorMetrics::new(),
        )
        .unwrap();
        (handle, codec)
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let driver = InProcessDriver::new(LoopbackEngine::new(Duration::ZERO));
        let result = PoolActorHandle::spawn(
            Box::new(driver),
            codec(),
            &PoolSettings::default(),
            ActorMetrics::new(),
        );
        assert!(matches!(result, Err(LwError::Runtime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resolves_with_playback_url() {
        let (pool, codec) = spawn_pool(Duration::from_millis(200), 1);

        let sub = pool
            .start_channel(codec.encode("abc"), PortHints::default())
            .await
            .unwrap();
        let (mut handle, completion) = sub.into_parts();
        let url = completion.recv().await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:"), "unexpected url {url}");

        let snapshot = pool.lookup("abc").await.unwrap().unwrap();
        assert_eq!(snapshot.status, ChannelStatus::Working);
        assert!(snapshot.stats.is_some());

        pool.stop_channel(&mut handle).await.unwrap();
        assert!(handle.is_null());
        pool.stop_channel(&mut handle).await.unwrap();
        assert_eq!(pool.status().await.unwrap().idle, 1);

        pool.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_token_resolves_immediately() {
        let (pool, _) = spawn_pool(Duration::from_millis(200), 1);

        let sub = pool
            .start_channel("/not-a-token", PortHints::default())
            .await
            .unwrap();
        assert!(sub.handle.is_null());
        assert_eq!(sub.completion.recv().await, Err(ChannelError::InvalidRequest));
        assert!(pool.dump_channels().await.unwrap().is_empty());

        pool.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_idle_channel() {
        let (pool, codec) = spawn_pool(Duration::from_millis(10), 4);

        let (mut handle, completion) = pool
            .start_channel(codec.encode("abc"), PortHints::default())
            .await
            .unwrap()
            .into_parts();
        completion.recv().await.unwrap();
        pool.stop_channel(&mut handle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert!(pool.lookup("abc").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pool.lookup("abc").await.unwrap().is_none());
        assert!(pool.metrics().sweeps() >= 10);

        pool.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_pending_and_stops_actor() {
        let (pool, codec) = spawn_pool(Duration::from_secs(60), 1);

        let sub = pool
            .start_channel(codec.encode("abc"), PortHints::default())
            .await
            .unwrap();

        pool.shutdown().await.unwrap();
        assert_eq!(sub.completion.recv().await, Err(ChannelError::Aborted));
        assert!(pool.is_cancelled());

        tokio::task::yield_now().await;
        assert!(matches!(pool.status().await, Err(LwError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_from_sync_code() {
        let (pool, codec) = spawn_pool(Duration::from_millis(10), 2);

        let (handle, completion) = pool
            .start_channel(codec.encode("abc"), PortHints::default())
            .await
            .unwrap()
            .into_parts();
        completion.recv().await.unwrap();

        pool.release(handle);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let snapshot = pool.lookup("abc").await.unwrap().unwrap();
        assert_eq!(snapshot.reference_count, 0);

        pool.cancel();
    }
}
