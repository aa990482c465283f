//! Token and pool fixtures.
//!
//! All helpers share one fixed key, so tokens built here decode in any pool
//! spawned here.

use crate::fake_engine::{fake_driver, FakeEngine};
use common::secret::SecretString;
use live_worker::actors::{ActorMetrics, PoolActorHandle};
use live_worker::pool::PoolSettings;
use live_worker::token::KeyedTokenCodec;
use std::sync::Arc;
use std::time::Duration;

/// Token key used by every fixture.
pub const TEST_TOKEN_KEY: &str = "lw-test-token-key-0123456789abcdef";

/// Codec keyed with [`TEST_TOKEN_KEY`].
#[must_use]
pub fn test_codec() -> KeyedTokenCodec {
    KeyedTokenCodec::new(&SecretString::from(TEST_TOKEN_KEY))
}

/// Request token (the gateway path) for `resource_id`.
#[must_use]
pub fn token_for(resource_id: &str) -> String {
    test_codec().encode(resource_id)
}

/// Token whose signature does not verify.
#[must_use]
pub fn forged_token(resource_id: &str) -> String {
    KeyedTokenCodec::new(&SecretString::from("some-other-key")).encode(resource_id)
}

/// Default pool settings with the given admission limit.
#[must_use]
pub fn pool_settings(max_parallel: usize) -> PoolSettings {
    PoolSettings {
        max_parallel,
        ..PoolSettings::default()
    }
}

/// Pool settings with a short sweep period, for tests that wait on sweeps.
#[must_use]
pub fn fast_sweep_settings(max_parallel: usize, idle_grace_ticks: u32) -> PoolSettings {
    PoolSettings {
        max_parallel,
        idle_grace_ticks,
        sweep_interval: Duration::from_millis(50),
    }
}

/// Spawn a pool actor over `engine` on the current runtime.
///
/// # Panics
///
/// Panics outside a tokio runtime.
#[must_use]
pub fn spawn_pool(engine: &FakeEngine, settings: &PoolSettings) -> PoolActorHandle {
    PoolActorHandle::spawn(
        fake_driver(engine),
        Arc::new(test_codec()),
        settings,
        ActorMetrics::new(),
    )
    .expect("pool actor should spawn inside a runtime")
}
