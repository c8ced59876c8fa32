//! Multi-device convergence through a shared in-memory remote store.
//!
//! Each device has its own store, bus and coordinator; the only thing they
//! share is the remote. Tests follow GIVEN/WHEN/THEN.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use baton_core::{DeviceId, SyncConfig, TeamId, Timestamp};
use baton_events::{PriorityEventBus, RaceEvent};
use baton_store::{LocalRaceStore, Table, TeamStorage};
use baton_sync::{
    Channel, ChannelState, InMemoryRemoteStore, ReconciliationLoop, RemoteStore, SharedStore,
    SyncCoordinator,
};
use tokio::sync::RwLock;

const T: Timestamp = 1_717_243_200_000;

fn team() -> TeamId {
    TeamId::from("falcons")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 20,
        max_subscribe_attempts: 3,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
        subscribe_timeout_ms: 200,
        push_max_attempts: 2,
        push_timeout_ms: 200,
        ..SyncConfig::default()
    }
}

struct Device {
    store: SharedStore,
    bus: PriorityEventBus,
    sync: SyncCoordinator,
}

impl Device {
    fn new(remote: &Arc<InMemoryRemoteStore>, name: &str) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(LocalRaceStore::default().with_team(team())));
        let bus = PriorityEventBus::default();
        let remote: Arc<dyn RemoteStore> = Arc::clone(remote) as Arc<dyn RemoteStore>;
        let sync = SyncCoordinator::new(
            team(),
            DeviceId::from(name),
            Arc::clone(&store),
            remote,
            bus.clone(),
            fast_config(),
        );
        sync.attach();
        Self { store, bus, sync }
    }

    /// Apply a local edit, publish its events and wait for the push.
    async fn edit(
        &self,
        f: impl FnOnce(&mut LocalRaceStore) -> baton_core::Result<Vec<RaceEvent>>,
    ) {
        let events = {
            let mut store = self.store.write().await;
            f(&mut store).unwrap()
        };
        self.bus.publish_all(events);
        self.bus.wait_idle().await;
    }

    async fn pace(&self, runner_id: u32) -> u32 {
        self.store.read().await.runner(runner_id).unwrap().pace
    }
}

/// Device A runs setup and seeds the remote; device B pulls it.
async fn two_synced_devices(remote: &Arc<InMemoryRemoteStore>) -> (Device, Device) {
    let a = Device::new(remote, "device-a");
    a.edit(|s| s.complete_setup(T)).await;
    let b = Device::new(remote, "device-b");
    b.sync.initial_sync().await.unwrap();
    b.bus.wait_idle().await;
    (a, b)
}

// ==========================================================================
// Seeding and initial sync
// ==========================================================================

#[tokio::test]
async fn should_seed_empty_remote_from_completed_setup() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (_a, b) = two_synced_devices(&remote).await;

    assert_eq!(remote.runners(&team()).len(), 12);
    assert_eq!(remote.legs(&team()).len(), 36);

    let store = b.store.read().await;
    assert_eq!(store.legs().len(), 36);
    assert!(store.metadata().setup_locked);
    assert!(store.runners().iter().all(|r| r.remote_id.is_some()));
}

#[tokio::test]
async fn should_not_reapply_identical_remote_data() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (_a, b) = two_synced_devices(&remote).await;

    let runners = b.sync.fetch_runners().await.unwrap();
    let legs = b.sync.fetch_legs().await.unwrap();

    assert_eq!(runners.remote_records, 12);
    assert_eq!(runners.applied, 0);
    assert_eq!(legs.applied, 0);
}

// ==========================================================================
// Offline edit then reconnect
// ==========================================================================

#[tokio::test]
async fn should_deliver_offline_edit_after_reconnect() {
    // GIVEN: two synced devices, A loses connectivity
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;
    a.sync.handle_offline();

    // WHEN: A edits a pace while offline
    a.edit(|s| s.set_runner_pace(3, 420)).await;

    // THEN: the change waits in the queue and the remote is untouched
    assert_eq!(a.sync.pending_changes(), 1);
    assert_eq!(a.sync.queued_changes()[0].table, Table::Runners);
    assert_ne!(remote.runners(&team())[2].pace, 420);

    // WHEN: A reconnects and B refetches
    a.sync.handle_online().await;
    b.sync.fetch_runners().await.unwrap();

    // THEN: both devices and the remote agree, down to updated_at
    assert_eq!(a.sync.pending_changes(), 0);
    let local_stamp = a.store.read().await.runner(3).unwrap().updated_at;
    let row = remote
        .runners(&team())
        .into_iter()
        .find(|r| r.name == "Runner 3")
        .unwrap();
    assert_eq!(row.pace, 420);
    assert_eq!(row.updated_at, local_stamp);
    assert_eq!(b.pace(3).await, 420);
    assert_eq!(b.store.read().await.runner(3).unwrap().updated_at, local_stamp);

    a.sync.shutdown();
}

#[tokio::test]
async fn should_push_leg_times_in_order_after_reconnect() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;
    a.sync.handle_offline();

    a.edit(|s| s.record_leg_start(1, T)).await;
    a.edit(|s| s.record_leg_finish(1, T + 1_800_000)).await;
    assert!(a.sync.pending_changes() >= 2);

    a.sync.handle_online().await;
    b.sync.fetch_legs().await.unwrap();

    let store = b.store.read().await;
    assert_eq!(store.leg(1).unwrap().actual_finish, Some(T + 1_800_000));
    assert_eq!(store.leg(2).unwrap().actual_start, Some(T + 1_800_000));
    assert_eq!(store.current_leg().map(|l| l.id), Some(2));

    a.sync.shutdown();
}

#[tokio::test]
async fn should_count_queued_records_when_pushing_offline() {
    // GIVEN: a synced device that goes offline with a dirty runner
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, _b) = two_synced_devices(&remote).await;
    a.sync.handle_offline();
    let events = a.store.write().await.set_runner_pace(6, 430).unwrap();
    for event in &events {
        a.sync.mark_event_dirty(event).await;
    }

    // WHEN: the push runs
    let report = a.sync.push_pending().await;

    // THEN: nothing was sent and the record waits in the queue
    assert_eq!(report.runners, 0);
    assert_eq!(report.queued, 1);
    assert_eq!(a.sync.pending_changes(), 1);

    // WHEN: back online, a second edit pushes straight through
    a.sync.handle_online().await;
    let events = a.store.write().await.set_runner_pace(6, 440).unwrap();
    for event in &events {
        a.sync.mark_event_dirty(event).await;
    }
    let report = a.sync.push_pending().await;

    assert_eq!(report.runners, 1);
    assert_eq!(report.queued, 0);
    a.sync.shutdown();
}

// ==========================================================================
// Conflicts
// ==========================================================================

#[tokio::test]
async fn should_let_newer_remote_update_prevail() {
    // GIVEN: A edits offline, then B edits the same runner later while online
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;
    a.sync.handle_offline();
    a.edit(|s| s.set_runner_pace(5, 300)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.edit(|s| s.set_runner_pace(5, 450)).await;

    // WHEN: A comes back and replays its older edit
    a.sync.handle_online().await;

    // THEN: the newer value wins everywhere
    assert_eq!(a.pace(5).await, 450);
    assert_eq!(b.pace(5).await, 450);
    let row = remote
        .runners(&team())
        .into_iter()
        .find(|r| r.name == "Runner 5")
        .unwrap();
    assert_eq!(row.pace, 450);

    a.sync.shutdown();
}

#[tokio::test]
async fn should_pick_up_newer_edit_on_fetch() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;

    a.edit(|s| s.set_runner_pace(7, 400)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.edit(|s| s.set_runner_pace(7, 410)).await;
    a.sync.fetch_runners().await.unwrap();

    assert_eq!(a.pace(7).await, 410);
}

// ==========================================================================
// Persistence
// ==========================================================================

#[tokio::test]
async fn should_keep_offline_queue_across_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemoteStore::new());
    let remote_dyn: Arc<dyn RemoteStore> = Arc::clone(&remote) as Arc<dyn RemoteStore>;

    let open = |store: SharedStore, bus: PriorityEventBus| {
        let storage = TeamStorage::open(tmp.path(), &team()).unwrap();
        SyncCoordinator::open(
            team(),
            DeviceId::from("device-a"),
            store,
            Arc::clone(&remote_dyn),
            bus,
            fast_config(),
            storage,
        )
    };

    // GIVEN: an offline edit on a persisted coordinator
    let store: SharedStore = Arc::new(RwLock::new(LocalRaceStore::default()));
    let bus = PriorityEventBus::default();
    let sync = open(Arc::clone(&store), bus.clone()).await.unwrap();
    sync.attach();
    sync.handle_offline();
    let events = store.write().await.set_runner_pace(2, 500).unwrap();
    bus.publish_all(events);
    bus.wait_idle().await;
    assert_eq!(sync.pending_changes(), 1);

    // WHEN: the app restarts
    let reopened = open(
        Arc::new(RwLock::new(LocalRaceStore::default())),
        PriorityEventBus::default(),
    )
    .await
    .unwrap();

    // THEN: the queued change is still there and replays
    assert_eq!(reopened.pending_changes(), 1);
    let report = reopened.replay_offline_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(remote.runners(&team())[0].pace, 500);
}

#[tokio::test]
async fn should_open_with_unreadable_snapshot_and_keep_queue() {
    // GIVEN: a persisted queue next to a corrupt roster snapshot
    let tmp = tempfile::tempdir().unwrap();
    let storage = TeamStorage::open(tmp.path(), &team()).unwrap();
    let mut queue = baton_store::OfflineQueue::persistent(storage.clone()).unwrap();
    let mut runner = baton_core::Runner::placeholder(2);
    runner.pace = 505;
    queue.push(baton_store::OfflineChange::runner(runner)).unwrap();
    std::fs::write(storage.dir().join("runners.json"), "{not json").unwrap();

    // WHEN: the coordinator opens
    let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::new());
    let sync = SyncCoordinator::open(
        team(),
        DeviceId::from("device-a"),
        Arc::new(RwLock::new(LocalRaceStore::default())),
        remote,
        PriorityEventBus::default(),
        fast_config(),
        storage,
    )
    .await
    .unwrap();

    // THEN: the snapshot is skipped and the queue survives
    assert_eq!(sync.pending_changes(), 1);
    assert!(!sync.store().read().await.state().is_initialized());
}

// ==========================================================================
// Realtime
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn should_refetch_after_change_notification() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;
    b.sync.start_realtime();
    for _ in 0..50 {
        if b.sync.channel_state(Channel::Runners) == ChannelState::Subscribed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    a.edit(|s| s.set_runner_pace(9, 515)).await;

    for _ in 0..100 {
        if b.pace(9).await == 515 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.pace(9).await, 515);
    b.sync.shutdown();
}

#[tokio::test(start_paused = true)]
async fn should_abandon_channel_after_repeated_failures_and_recover_on_retry() {
    // GIVEN: every subscribe attempt fails
    let remote = Arc::new(InMemoryRemoteStore::new());
    let device = Device::new(&remote, "device-a");
    remote.fail_next_subscribes(u32::MAX);

    // WHEN: realtime starts
    device.sync.start_realtime();
    for _ in 0..100 {
        if Channel::ALL
            .iter()
            .all(|c| device.sync.channel_state(*c) == ChannelState::Abandoned)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // THEN: each channel gives up after the configured attempts
    assert_eq!(device.sync.channel_state(Channel::Legs), ChannelState::Abandoned);
    assert!(!device.sync.realtime_active());

    // WHEN: the remote recovers and realtime is retried
    remote.fail_next_subscribes(0);
    device.sync.retry_realtime();
    for _ in 0..100 {
        if device.sync.realtime_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // THEN: the channels are back
    assert_eq!(device.sync.channel_state(Channel::Runners), ChannelState::Subscribed);
    device.sync.shutdown();
}

#[tokio::test]
async fn should_reconcile_missed_changes() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (a, b) = two_synced_devices(&remote).await;
    a.edit(|s| s.set_pace_override(4, Some(390))).await;

    let reconciler = ReconciliationLoop::new(b.sync.clone(), Duration::from_secs(30));
    let outcome = reconciler.reconcile_once().await.unwrap();

    assert!(outcome.applied >= 1);
    assert!(outcome.resubscribed);
    assert_eq!(b.store.read().await.leg(4).unwrap().pace_override, Some(390));
    b.sync.shutdown();
}
