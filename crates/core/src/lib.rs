//! Core types, errors, and configuration for Baton.
//!
//! Every other crate in the workspace speaks in these terms:
//!
//! - **Types**: [`Runner`], [`Leg`], [`RaceState`] and the id newtypes
//! - **Errors**: [`Error`] with a crate-wide [`Result`] alias
//! - **Config**: [`BatonConfig`] loaded from TOML or JSON

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;
pub mod types;

pub use config::{BatonConfig, BusConfig, RaceConfig, StorageConfig, SyncConfig};
pub use error::Error;
pub use result::{Result, ResultExt};
pub use types::{
    default_runners, default_van_for, DeviceId, Leg, LegId, RaceState, RemoteId, Runner,
    RunnerId, TeamId, Timestamp, Van, DEFAULT_DISTANCES, DEFAULT_PACE_SECS, RUNNER_COUNT,
};
