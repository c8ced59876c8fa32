#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Baton
//!
//! Relay race schedule projection and offline-tolerant multi-device sync.
//!
//! This library re-exports the Baton workspace crates and hosts the CLI
//! commands so they can be exercised from tests.

pub use baton_core;
pub use baton_events;
pub use baton_projection;
pub use baton_store;
pub use baton_sync;

pub mod cli;
pub mod commands;
