//! Actor that owns the channel pool.
//!
//! ```text
//! gateway / admin ──PoolMessage──▶ PoolActor ──▶ ChannelPool ──▶ ChannelDriver
//!                                     ▲                              │
//!                                     └──────── DriverEvent ─────────┘
//! ```
//!
//! The actor is the only task touching pool state. Engine callbacks and
//! worker reports arrive as driver events on the same loop, and the sweeper
//! is a timer branch of that loop.

pub mod messages;
pub mod metrics;
pub mod pool;

pub use messages::PoolMessage;
pub use metrics::{ActorMetrics, MailboxLevel, MailboxMonitor};
pub use pool::{PoolActor, PoolActorHandle};
