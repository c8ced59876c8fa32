//! Remote synchronization for Baton.
//!
//! - **Remote seam**: [`RemoteStore`] and the [`InMemoryRemoteStore`] used by
//!   tests and the simulator
//! - **Merge**: [`merge_records`] last-write-wins by `updated_at`, with
//!   [`IdMapper`] keeping local ids stable
//! - **Coordinator**: [`SyncCoordinator`] pushes local edits, replays the
//!   offline queue, listens to realtime channels and refetches
//! - **Reconciliation**: [`ReconciliationLoop`] refetches on an interval

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod id_mapper;
pub mod memory;
pub mod merge;
pub mod reconcile;
pub mod remote;
pub mod subscription;

pub use coordinator::{FetchReport, PushReport, ReplayReport, SharedStore, SyncCoordinator};
pub use dedup::BroadcastDeduper;
pub use error::{Result, SyncError};
pub use id_mapper::IdMapper;
pub use memory::InMemoryRemoteStore;
pub use merge::{is_newer, merge_acks, merge_records};
pub use reconcile::{ReconcileOutcome, ReconciliationLoop};
pub use remote::{
    BroadcastSignal, ChangeNotification, ChangeType, RemoteLeg, RemoteRecord, RemoteRunner,
    RemoteStore,
};
pub use subscription::{Channel, ChannelFailure, ChannelState, SubscriptionTracker};
