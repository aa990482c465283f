//! # Live Worker Test Utilities
//!
//! Fakes and fixtures for exercising the pool without a real engine.
//!
//! ## Modules
//!
//! - `fake_engine` - scripted [`NativeEngine`](live_worker::engine::NativeEngine)
//!   whose readiness callbacks fire when the test says so
//! - `fixtures` - token codec, token builders and pool spawning helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lw_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = FakeEngine::new();
//!     let pool = spawn_pool(&engine, &pool_settings(1));
//!
//!     let sub = pool.start_channel(token_for("abc"), PortHints::default()).await.unwrap();
//!     engine.complete_all(true);
//!     assert!(sub.completion.recv().await.is_ok());
//! }
//! ```
//!
//! Use these from integration tests (`tests/`) only. Unit tests inside
//! `live-worker` would see a second copy of the library and its traits.

pub mod fake_engine;
pub mod fixtures;

pub use fake_engine::*;
pub use fixtures::*;
