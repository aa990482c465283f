//! Channel list pinning task.
//!
//! Periodically fetches the channel list from the management service and
//! subscribes to every listed channel with its port hints, so those channels
//! run ahead of viewer requests. Each refresh subscribes to the new list
//! first and then releases the previous subscriptions. A listed channel whose
//! ports changed is therefore replaced through the pool's reconnect path.
//!
//! A failed fetch counts as an empty list: the previous set is released and
//! the channels fall back to normal idle expiry.
//!
//! Request: `GET <url>?ip=<service_ip>&type=<peer_type>`. Response:
//!
//! ```json
//! {"channels": [{"id": "c1", "url": "synacast://<token>", "port": "8001:8002"}]}
//! ```
//!
//! # Graceful Shutdown
//!
//! When the cancellation token fires, every pinned subscription is released
//! before the task returns.

use crate::actors::PoolActorHandle;
use crate::config::ChannelListConfig;
use crate::errors::LwError;
use crate::pool::{ChannelHandle, PortHints};
use crate::token::token_from_engine_uri;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Timeout for one channel list request.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One channel the management service wants pinned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelListEntry {
    #[serde(default)]
    pub id: String,
    /// Engine URI or bare request token.
    pub url: String,
    /// `"tcp:udp"`.
    #[serde(default)]
    pub port: String,
}

impl ChannelListEntry {
    /// Request token to subscribe with.
    #[must_use]
    pub fn token(&self) -> &str {
        token_from_engine_uri(&self.url)
    }

    #[must_use]
    pub fn hints(&self) -> PortHints {
        parse_ports(&self.port)
    }
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    channels: Vec<ChannelListEntry>,
}

/// Parse `"tcp:udp"`. A missing or malformed half is 0 (no preference).
#[must_use]
pub fn parse_ports(port: &str) -> PortHints {
    let (tcp, udp) = port.split_once(':').unwrap_or((port, ""));
    let parse = |raw: &str| raw.trim().parse::<u16>().unwrap_or(0);
    PortHints::new(parse(tcp), parse(udp))
}

/// HTTP client for the management channel list.
#[derive(Debug, Clone)]
pub struct ChannelListClient {
    http: reqwest::Client,
    url: String,
    service_ip: String,
    peer_type: u8,
}

impl ChannelListClient {
    #[must_use]
    pub fn new(config: &ChannelListConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(target: "lw.task.channel_list", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            http,
            url: config.url.clone(),
            service_ip: config.service_ip.clone(),
            peer_type: config.peer_type,
        }
    }

    /// Fetch the current channel list.
    ///
    /// # Errors
    ///
    /// Returns `LwError::ChannelList` if the request fails, the service
    /// answers with a non-success status, or the body does not parse.
    pub async fn fetch(&self) -> Result<Vec<ChannelListEntry>, LwError> {
        let peer_type = self.peer_type.to_string();
        let response = self
            .http
            .get(&self.url)
            .query(&[("ip", self.service_ip.as_str()), ("type", peer_type.as_str())])
            .send()
            .await
            .map_err(|e| LwError::ChannelList(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LwError::ChannelList(format!("unexpected status {status}")));
        }

        let body: ChannelListResponse = response
            .json()
            .await
            .map_err(|e| LwError::ChannelList(format!("invalid channel list: {e}")))?;
        Ok(body.channels)
    }
}

/// Subscriptions held on behalf of the channel list.
pub struct PinnedChannels {
    pool: PoolActorHandle,
    handles: Vec<ChannelHandle>,
}

impl PinnedChannels {
    #[must_use]
    pub fn new(pool: PoolActorHandle) -> Self {
        Self {
            pool,
            handles: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Subscribe to every entry, then release the previously pinned set.
    ///
    /// Returns how many channels are pinned afterwards. Entries the pool
    /// rejects are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Internal` if the pool actor has stopped.
    pub async fn replace(&mut self, entries: &[ChannelListEntry]) -> Result<usize, LwError> {
        let mut pinned = Vec::with_capacity(entries.len());
        for entry in entries {
            let (handle, completion) = self
                .pool
                .start_channel(entry.token(), entry.hints())
                .await?
                .into_parts();
            if handle.is_null() {
                let error = completion.recv().await.err();
                warn!(
                    target: "lw.task.channel_list",
                    id = %entry.id,
                    error = error.map(|e| e.as_str()),
                    "Listed channel failed to start"
                );
                continue;
            }

            let id = entry.id.clone();
            tokio::spawn(async move {
                match completion.recv().await {
                    Ok(_) => debug!(target: "lw.task.channel_list", id = %id, "Listed channel ready"),
                    Err(e) => debug!(
                        target: "lw.task.channel_list",
                        id = %id,
                        error = e.as_str(),
                        "Listed channel not ready"
                    ),
                }
            });
            pinned.push(handle);
        }

        let previous = std::mem::replace(&mut self.handles, pinned);
        self.release(previous).await?;
        Ok(self.handles.len())
    }

    /// Release every pinned subscription.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Internal` if the pool actor has stopped.
    pub async fn release_all(&mut self) -> Result<(), LwError> {
        let previous = std::mem::take(&mut self.handles);
        self.release(previous).await
    }

    async fn release(&self, handles: Vec<ChannelHandle>) -> Result<(), LwError> {
        for mut handle in handles {
            self.pool.stop_channel(&mut handle).await?;
        }
        Ok(())
    }
}

/// Start the channel list pinning task.
///
/// Fetches after `config.first_fetch_delay`, then every
/// `config.refresh_interval`, until `cancel_token` fires.
#[instrument(skip_all, name = "lw.task.channel_list")]
pub async fn start_channel_list_task(
    client: ChannelListClient,
    pool: PoolActorHandle,
    config: ChannelListConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "lw.task.channel_list",
        refresh_interval_secs = config.refresh_interval.as_secs(),
        peer_type = config.peer_type,
        "Starting channel list task"
    );

    let mut pinned = PinnedChannels::new(pool);
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + config.first_fetch_delay,
        config.refresh_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                refresh(&client, &mut pinned).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "lw.task.channel_list",
                    "Channel list task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    if let Err(e) = pinned.release_all().await {
        warn!(target: "lw.task.channel_list", error = %e, "Failed to release listed channels");
    }
    info!(target: "lw.task.channel_list", "Channel list task stopped");
}

/// One fetch-and-replace round.
async fn refresh(client: &ChannelListClient, pinned: &mut PinnedChannels) {
    let entries = match client.fetch().await {
        Ok(entries) => {
            info!(target: "lw.task.channel_list", channels = entries.len(), "Fetched channel list");
            entries
        }
        Err(e) => {
            warn!(target: "lw.task.channel_list", error = %e, "Channel list fetch failed");
            Vec::new()
        }
    };

    match pinned.replace(&entries).await {
        Ok(count) => debug!(target: "lw.task.channel_list", pinned = count, "Channel list applied"),
        Err(e) => warn!(target: "lw.task.channel_list", error = %e, "Failed to apply channel list"),
    }
}
