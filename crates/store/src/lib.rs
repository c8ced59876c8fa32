//! Local race state, offline queue and per-team persistence.
//!
//! - **Store**: [`LocalRaceStore`] holds the canonical [`baton_core::RaceState`];
//!   every setter returns the [`baton_events::RaceEvent`]s it implies
//! - **Offline queue**: [`OfflineQueue`] of [`OfflineChange`]s awaiting replay
//! - **Storage**: [`TeamStorage`] JSON snapshots under `<data_dir>/<team_id>/`

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod effects;
pub mod offline_queue;
pub mod roster;
pub mod storage;
pub mod store;

pub use effects::{leg_update_events, transition_events};
pub use offline_queue::{ChangePayload, OfflineChange, OfflineQueue, Table};
pub use roster::{normalize_roster, reassign_orphaned_legs};
pub use storage::{PersistedMeta, RenameMap, TeamStorage};
pub use store::{FixReport, LocalRaceStore, SyncMetadata};
