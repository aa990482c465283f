//! Messages accepted by the pool actor.
//!
//! Every message carries a `respond_to` one-shot so the handle can await the
//! outcome. Replies are sent after the pool has applied the change.

use crate::pool::{ChannelHandle, ChannelSnapshot, PoolStatus, PortHints, Subscription};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum PoolMessage {
    /// Subscribe to the channel behind `token`.
    StartChannel {
        token: String,
        hints: PortHints,
        respond_to: oneshot::Sender<Subscription>,
    },

    /// Release one subscription.
    StopChannel {
        handle: ChannelHandle,
        respond_to: oneshot::Sender<()>,
    },

    SetMaxParallel {
        max_parallel: usize,
        respond_to: oneshot::Sender<()>,
    },

    DumpChannels {
        respond_to: oneshot::Sender<Vec<ChannelSnapshot>>,
    },

    /// Live channel for one resource id.
    Lookup {
        resource_id: String,
        respond_to: oneshot::Sender<Option<ChannelSnapshot>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<PoolStatus>,
    },

    /// Evict everything and stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },
}
