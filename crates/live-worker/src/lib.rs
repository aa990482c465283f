//! Live Worker Library
//!
//! Admission and lifecycle management for live streaming channels:
//!
//! - Ref-counted channels shared by every subscriber of one resource id
//! - Capacity-bounded idle pool with least-recently-idled eviction
//! - Exactly-once completion delivery to every subscriber
//! - Periodic health and idle-expiry sweeps
//! - Optional per-channel worker processes with framed IPC and crash reaping
//! - Channels pinned from a management service's channel list
//!
//! # Architecture
//!
//! ```text
//! gateway (axum) ──▶ PoolActorHandle ──▶ PoolActor
//!                                          └── ChannelPool
//!                                                └── ChannelDriver
//!                                                      ├── InProcessDriver<E: NativeEngine>
//!                                                      └── ProcessDriver ──stdio──▶ worker
//! ```
//!
//! # Modules
//!
//! - [`actors`] - pool actor, its messages and mailbox metrics
//! - [`pool`] - channel state machine
//! - [`engine`] - engine binding and channel drivers
//! - [`worker`] - child side of process isolation
//! - [`gateway`] - HTTP gateway and admin routes
//! - [`tasks`] - channel list pinning task
//! - [`token`] - request token decoding
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types with stable codes
//! - [`observability`] - metrics and health endpoints

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod pool;
pub mod tasks;
pub mod token;
pub mod worker;
