//! Metrics definitions for the live worker.
//!
//! All metrics follow Prometheus naming conventions:
//! - `lw_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in the code:
//! - `outcome`: 4 values (created, joined, invalid, unavailable)
//! - `reason`: 5 values (capacity, expired, failed, reconnect, shutdown)
//! - `actor_type`: 1 value (pool)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Channel readiness is
/// dominated by the engine's buffering, so its buckets run to 30s.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("lw_channel_ready".to_string()),
            &[
                0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set channel ready buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Pool Gauges
// ============================================================================

/// Set the pool gauges.
///
/// Metrics: `lw_channels_active` (live channels with subscribers),
/// `lw_channels_total` (every tracked channel, including draining ones)
pub fn set_pool_channels(active: usize, total: usize) {
    // usize to f64 conversion is safe for realistic pool sizes
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("lw_channels_active").set(active as f64);
        gauge!("lw_channels_total").set(total as f64);
    }
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `lw_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    // usize to f64 conversion is safe for realistic mailbox depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("lw_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Channel Lifecycle Counters
// ============================================================================

/// Record a `start_channel` outcome.
///
/// Metric: `lw_channel_starts_total`
/// Labels: `outcome` (created, joined, invalid, unavailable)
pub fn record_channel_start(outcome: &str) {
    counter!("lw_channel_starts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a channel eviction.
///
/// Metric: `lw_channel_evictions_total`
/// Labels: `reason` (capacity, expired, failed, reconnect, shutdown)
pub fn record_eviction(reason: &str) {
    counter!("lw_channel_evictions_total", "reason" => reason.to_string()).increment(1);
}

/// Record a worker process that exited without being asked to.
///
/// Metric: `lw_worker_deaths_total`
///
/// Any non-zero rate means the engine is crashing inside workers.
pub fn record_worker_death() {
    counter!("lw_worker_deaths_total").increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record time from channel creation to its first engine result.
///
/// Metric: `lw_channel_ready_seconds`
/// Labels: `result` (ok, error)
pub fn record_channel_ready(ok: bool, duration: Duration) {
    let result = if ok { "ok" } else { "error" };
    histogram!("lw_channel_ready_seconds", "result" => result).record(duration.as_secs_f64());
}
