//! Common utilities and types shared across live-worker components.

#![warn(clippy::pedantic)]

/// Module for shared configuration types
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
