//! Background tasks for the live worker.
//!
//! # Tasks
//!
//! - `channel_list` - Keeps the management service's channel list pinned in the pool

pub mod channel_list;

pub use channel_list::{
    start_channel_list_task, ChannelListClient, ChannelListEntry, PinnedChannels,
};
