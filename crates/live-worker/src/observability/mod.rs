//! Observability for the live worker.
//!
//! Loop and handler spans use `#[instrument(skip_all)]` with explicit fields.
//! Request tokens and engine URIs carry signed payloads and are never logged;
//! log lines name channels by key and resource id instead. The gateway's
//! request span records the method only, not the path.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `lw_channels_active` | Gauge | none | Live channels with subscribers |
//! | `lw_channels_total` | Gauge | none | Every tracked channel |
//! | `lw_channel_starts_total` | Counter | `outcome` | `start_channel` results |
//! | `lw_channel_evictions_total` | Counter | `reason` | Evictions by cause |
//! | `lw_channel_ready_seconds` | Histogram | `result` | Time to first engine result |
//! | `lw_worker_deaths_total` | Counter | none | Worker processes that crashed |
//! | `lw_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
