//! Pool actor mailbox monitoring and counters.
//!
//! | Level    | Depth     |
//! |----------|-----------|
//! | Normal   | <= 100    |
//! | Warning  | 101-500   |
//! | Critical | > 500     |

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const POOL_MAILBOX_NORMAL: usize = 100;
pub const POOL_MAILBOX_WARNING: usize = 500;

/// Label used for the pool actor's mailbox gauge.
const ACTOR_TYPE: &str = "pool";

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

impl MailboxLevel {
    #[must_use]
    pub const fn for_depth(depth: usize) -> Self {
        if depth > POOL_MAILBOX_WARNING {
            MailboxLevel::Critical
        } else if depth > POOL_MAILBOX_NORMAL {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Tracks how far the pool actor is behind its callers.
///
/// Handles call [`record_enqueue`](Self::record_enqueue) before sending; the
/// actor calls [`record_dequeue`](Self::record_dequeue) as it takes each
/// message.
#[derive(Debug, Default)]
pub struct MailboxMonitor {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(ACTOR_TYPE, new_depth);

        match MailboxLevel::for_depth(new_depth) {
            MailboxLevel::Critical => warn!(
                target: "lw.actor.mailbox",
                depth = new_depth,
                threshold = POOL_MAILBOX_WARNING,
                "Pool mailbox depth critical"
            ),
            // Log once when crossing into warning
            MailboxLevel::Warning if new_depth == POOL_MAILBOX_NORMAL + 1 => debug!(
                target: "lw.actor.mailbox",
                depth = new_depth,
                "Pool mailbox depth elevated"
            ),
            _ => {}
        }
    }

    /// Undo an enqueue whose send failed.
    pub fn record_send_failed(&self) {
        self.decrement();
    }

    pub fn record_dequeue(&self) {
        let depth = self.decrement();
        metrics::set_actor_mailbox_depth(ACTOR_TYPE, depth);
    }

    fn decrement(&self) -> usize {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        MailboxLevel::for_depth(self.current_depth())
    }
}

/// Counters shared between the pool actor and whoever supervises it.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub mailbox: MailboxMonitor,
    messages_processed: AtomicU64,
    driver_events: AtomicU64,
    sweeps: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_driver_event(&self) {
        self.driver_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn driver_events(&self) -> u64 {
        self.driver_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}
