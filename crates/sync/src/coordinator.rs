//! Sync coordinator: keeps one team's local store and the remote store converged.
//!
//! Local edits reach the coordinator as high-priority bus events. They are
//! marked dirty and pushed; when the remote is unreachable they go to the
//! offline queue instead. Remote changes arrive through realtime channels and
//! trigger a debounced refetch that merges by last-write-wins.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::{DeviceId, Leg, RemoteId, ResultExt, Runner, RunnerId, SyncConfig, TeamId};
use baton_events::{EventHandler, EventPattern, PriorityEventBus, Priority, RaceEvent, RacePayload, SubscriberId};
use baton_projection::validate_race_state;
use baton_resilience::{BackoffPolicy, CircuitBreakerConfig, Retrier, RetryConfig};
use baton_store::{
    ChangePayload, LocalRaceStore, OfflineChange, OfflineQueue, PersistedMeta, RenameMap, Table,
    TeamStorage,
};
use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dedup::BroadcastDeduper;
use crate::error::{Result, SyncError};
use crate::id_mapper::IdMapper;
use crate::merge::{merge_acks, merge_records};
use crate::remote::{BroadcastSignal, RemoteLeg, RemoteRunner, RemoteStore};
use crate::subscription::{Channel, ChannelFailure, ChannelState, SubscriptionTracker};

/// The local store as shared between the UI, the bus handlers and sync.
pub type SharedStore = Arc<RwLock<LocalRaceStore>>;

/// Breaker guarding every remote call.
const REMOTE_BREAKER: &str = "remote";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub runners: usize,
    pub legs: usize,
    /// Records sent to the offline queue instead.
    pub queued: usize,
}

impl PushReport {
    fn absorb(&mut self, other: Self) {
        self.runners += other.runners;
        self.legs += other.legs;
        self.queued += other.queued;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Rows the remote returned.
    pub remote_records: usize,
    /// Rows that won the merge.
    pub applied: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
}

/// Clears an in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type DirtyKey = (Table, u32);

struct Inner {
    team: TeamId,
    device: DeviceId,
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    bus: PriorityEventBus,
    config: SyncConfig,
    retrier: Retrier,
    retry: RetryConfig,
    storage: Option<TeamStorage>,
    queue: Mutex<OfflineQueue>,
    renames: Mutex<RenameMap>,
    ids: Mutex<IdMapper>,
    dirty: Mutex<BTreeSet<DirtyKey>>,
    trackers: Mutex<HashMap<Channel, SubscriptionTracker>>,
    dedup: Mutex<BroadcastDeduper>,
    tasks: Mutex<HashMap<Channel, JoinHandle<()>>>,
    online: AtomicBool,
    fetching_runners: AtomicBool,
    fetching_legs: AtomicBool,
    pushing: AtomicBool,
    pending_runners: AtomicBool,
    pending_legs: AtomicBool,
    refetch_scheduled: AtomicBool,
    stop: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sync for one team on one device. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("team", &self.inner.team)
            .field("device", &self.inner.device)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Coordinator with an in-memory offline queue and no persistence.
    pub fn new(
        team: TeamId,
        device: DeviceId,
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        bus: PriorityEventBus,
        config: SyncConfig,
    ) -> Self {
        Self::build(
            team,
            device,
            store,
            remote,
            bus,
            config,
            PersistedParts::default(),
        )
    }

    /// Coordinator backed by the team's directory: the offline queue, rename
    /// map and sync metadata are loaded, and the last snapshots are restored
    /// into an uninitialized store.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Local` if the offline queue, rename map or sync
    /// metadata cannot be read. Unreadable snapshots load as empty.
    pub async fn open(
        team: TeamId,
        device: DeviceId,
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        bus: PriorityEventBus,
        config: SyncConfig,
        storage: TeamStorage,
    ) -> Result<Self> {
        let queue = OfflineQueue::persistent(storage.clone())?;
        let renames = storage.load_renames()?;
        let meta = storage.load_meta()?;
        // Snapshots are a cache the next fetch rebuilds.
        let runners = storage.load_runners().or_default_logged(Vec::new());
        let legs = storage.load_legs().or_default_logged(Vec::new());

        let ids = {
            let mut local = store.write().await;
            local.set_team(team.clone());
            if meta.setup_locked {
                local.set_setup_locked(true);
            }
            if let Some(at) = meta.last_synced_at {
                local.mark_synced(at);
            }
            if !local.state().is_initialized() && !runners.is_empty() {
                local.restore_snapshot(runners, legs);
                info!(team = %team, "Restored persisted snapshot");
            }
            IdMapper::from_runners(local.runners())
        };
        info!(team = %team, pending = queue.len(), "Opened persisted sync state");

        Ok(Self::build(
            team,
            device,
            store,
            remote,
            bus,
            config,
            PersistedParts {
                storage: Some(storage),
                queue,
                renames,
                ids,
            },
        ))
    }

    fn build(
        team: TeamId,
        device: DeviceId,
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        bus: PriorityEventBus,
        config: SyncConfig,
        parts: PersistedParts,
    ) -> Self {
        let backoff = BackoffPolicy::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let trackers = Channel::ALL
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    SubscriptionTracker::new(channel, config.max_subscribe_attempts, backoff.clone()),
                )
            })
            .collect();
        let retry = RetryConfig::new(config.push_max_attempts, config.push_timeout())
            .with_backoff(backoff);
        let retrier = Retrier::new(CircuitBreakerConfig::new(
            config.breaker_failure_threshold,
            config.breaker_recovery(),
        ));
        let dedup = BroadcastDeduper::new(device.clone(), config.broadcast_dedup_window());
        let (stop, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                team,
                device,
                store,
                remote,
                bus,
                config,
                retrier,
                retry,
                storage: parts.storage,
                queue: Mutex::new(parts.queue),
                renames: Mutex::new(parts.renames),
                ids: Mutex::new(parts.ids),
                dirty: Mutex::new(BTreeSet::new()),
                trackers: Mutex::new(trackers),
                dedup: Mutex::new(dedup),
                tasks: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                fetching_runners: AtomicBool::new(false),
                fetching_legs: AtomicBool::new(false),
                pushing: AtomicBool::new(false),
                pending_runners: AtomicBool::new(false),
                pending_legs: AtomicBool::new(false),
                refetch_scheduled: AtomicBool::new(false),
                stop,
            }),
        }
    }

    // ==========================================================================
    // Accessors
    // ==========================================================================

    pub fn team(&self) -> &TeamId {
        &self.inner.team
    }

    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &PriorityEventBus {
        &self.inner.bus
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Changes waiting in the offline queue.
    pub fn pending_changes(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn queued_changes(&self) -> Vec<OfflineChange> {
        lock(&self.inner.queue).pending().to_vec()
    }

    pub fn channel_state(&self, channel: Channel) -> ChannelState {
        lock(&self.inner.trackers)
            .get(&channel)
            .map_or(ChannelState::Unsubscribed, SubscriptionTracker::state)
    }

    /// Whether any realtime channel is currently subscribed.
    pub fn realtime_active(&self) -> bool {
        lock(&self.inner.trackers)
            .values()
            .any(SubscriptionTracker::is_subscribed)
    }

    /// Register the push trigger on the bus.
    pub fn attach(&self) -> SubscriberId {
        let trigger = PushTrigger {
            inner: Arc::downgrade(&self.inner),
        };
        self.inner
            .bus
            .subscribe(EventPattern::ByPriority(Priority::High), Arc::new(trigger))
    }

    // ==========================================================================
    // Remote calls
    // ==========================================================================

    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.inner
            .retrier
            .run(REMOTE_BREAKER, op, &self.inner.retry)
            .await
            .into_result()
            .map_err(|e| {
                let error = SyncError::from(e);
                warn!(operation, error = %error, "Remote call failed");
                error
            })
    }

    async fn list_remote_runners(&self) -> Result<Vec<RemoteRunner>> {
        let remote = Arc::clone(&self.inner.remote);
        let team = self.inner.team.clone();
        self.call("list_runners", move |_| {
            let remote = Arc::clone(&remote);
            let team = team.clone();
            async move { remote.list_runners(&team).await }
        })
        .await
    }

    async fn list_remote_legs(&self) -> Result<Vec<RemoteLeg>> {
        let remote = Arc::clone(&self.inner.remote);
        let team = self.inner.team.clone();
        self.call("list_legs", move |_| {
            let remote = Arc::clone(&remote);
            let team = team.clone();
            async move { remote.list_legs(&team).await }
        })
        .await
    }

    // ==========================================================================
    // Fetch
    // ==========================================================================

    /// Pull every remote runner and merge it into the store.
    ///
    /// # Errors
    ///
    /// Returns the remote error when listing fails after retries.
    pub async fn fetch_runners(&self) -> Result<FetchReport> {
        let Some(_guard) = InFlight::try_acquire(&self.inner.fetching_runners) else {
            debug!("Runner fetch already in flight");
            return Ok(FetchReport::default());
        };
        let rows = self.list_remote_runners().await?;

        let (applied, events) = {
            let mut store = self.inner.store.write().await;
            if !rows.is_empty() {
                store.set_setup_locked(true);
            }
            let local = store.runners().to_vec();
            let mapped = lock(&self.inner.ids).map_runners(&rows, &local);
            self.remember_names(&mapped);

            let mut events = Vec::new();
            let applied = merge_records(
                mapped,
                &local,
                |r| r.id,
                |r| r.updated_at,
                |winners| events = store.apply_remote_runners(winners),
            );
            store.mark_synced(Utc::now());
            self.persist(&store);
            (applied, events)
        };

        debug!(remote = rows.len(), applied, "Fetched runners");
        self.inner.bus.publish_all(events);
        Ok(FetchReport {
            remote_records: rows.len(),
            applied,
        })
    }

    /// Pull every remote leg and merge it into the store, repairing any
    /// impossible state the merge produced.
    ///
    /// # Errors
    ///
    /// Returns the remote error when listing fails after retries.
    pub async fn fetch_legs(&self) -> Result<FetchReport> {
        let Some(_guard) = InFlight::try_acquire(&self.inner.fetching_legs) else {
            debug!("Leg fetch already in flight");
            return Ok(FetchReport::default());
        };
        let rows = self.list_remote_legs().await?;

        let (applied, events) = {
            let mut store = self.inner.store.write().await;
            let local = store.legs().to_vec();
            let mapped = lock(&self.inner.ids).map_legs(&rows, &local);

            let mut events = Vec::new();
            let applied = merge_records(
                mapped,
                &local,
                |l| l.id,
                |l| l.updated_at,
                |winners| events = store.apply_remote_legs(winners),
            );
            if applied > 0 && !validate_race_state(store.legs()).is_valid {
                let report = store.fix_data_inconsistencies();
                if report.changed {
                    warn!(changes = ?report.changes, "Repaired legs after remote merge");
                }
                if !report.unresolved.is_empty() {
                    warn!(unresolved = ?report.unresolved, "Leg states need a manual correction");
                }
                events.extend(report.events);
            }
            store.mark_synced(Utc::now());
            self.persist(&store);
            (applied, events)
        };

        debug!(remote = rows.len(), applied, "Fetched legs");
        self.inner.bus.publish_all(events);
        Ok(FetchReport {
            remote_records: rows.len(),
            applied,
        })
    }

    /// Fetch both tables. When the remote has no runners yet and local setup
    /// is complete, the local roster and legs are pushed out instead.
    ///
    /// # Errors
    ///
    /// Returns the first remote error.
    pub async fn initial_sync(&self) -> Result<()> {
        let runners = self.fetch_runners().await?;
        self.fetch_legs().await?;

        if runners.remote_records == 0 {
            let seeded = {
                let store = self.inner.store.read().await;
                if store.metadata().setup_complete {
                    self.mark_all_dirty(&store);
                    true
                } else {
                    false
                }
            };
            if seeded {
                info!(team = %self.inner.team, "Remote is empty, seeding from local setup");
                let report = self.push_pending().await;
                if report.queued > 0 {
                    warn!(queued = report.queued, "Seeding incomplete, rest left in the offline queue");
                }
            }
        }
        Ok(())
    }

    // ==========================================================================
    // Push
    // ==========================================================================

    fn mark_dirty(&self, keys: impl IntoIterator<Item = DirtyKey>) {
        lock(&self.inner.dirty).extend(keys);
    }

    fn mark_all_dirty(&self, store: &LocalRaceStore) {
        let runners = store.runners().iter().map(|r| (Table::Runners, r.id));
        let legs = store.legs().iter().map(|l| (Table::Legs, l.id));
        self.mark_dirty(runners.chain(legs));
    }

    /// Mark the records a local event touched.
    pub async fn mark_event_dirty(&self, event: &RaceEvent) {
        match &event.payload {
            RacePayload::RunnerUpdated { runner } => self.mark_dirty([(Table::Runners, runner.id)]),
            RacePayload::LegUpdated { leg } => self.mark_dirty([(Table::Legs, leg.id)]),
            RacePayload::RaceDataReplaced => {
                let store = self.inner.store.read().await;
                self.mark_all_dirty(&store);
            }
            _ => {}
        }
    }

    /// Push every dirty record. Runners go before legs so legs can reference
    /// their runners' remote ids. A call made while a push is running returns
    /// at once; the running push picks up the new records. Records that could
    /// not be sent land in the offline queue and are counted in `queued`.
    pub async fn push_pending(&self) -> PushReport {
        let mut report = PushReport::default();
        loop {
            {
                let Some(_guard) = InFlight::try_acquire(&self.inner.pushing) else {
                    debug!("Push already in flight");
                    return report;
                };
                loop {
                    let batch = std::mem::take(&mut *lock(&self.inner.dirty));
                    if batch.is_empty() {
                        break;
                    }
                    let (runners, legs) = self.collect(&batch).await;
                    report.absorb(self.push_records(runners, legs).await);
                }
            }
            if lock(&self.inner.dirty).is_empty() {
                return report;
            }
        }
    }

    async fn collect(&self, batch: &BTreeSet<DirtyKey>) -> (Vec<Runner>, Vec<Leg>) {
        let store = self.inner.store.read().await;
        let mut runners = Vec::new();
        let mut legs = Vec::new();
        for (table, id) in batch {
            match table {
                Table::Runners => runners.extend(store.runner(*id).cloned()),
                Table::Legs => legs.extend(store.leg(*id).cloned()),
            }
        }
        (runners, legs)
    }

    async fn push_records(&self, runners: Vec<Runner>, legs: Vec<Leg>) -> PushReport {
        let mut report = PushReport::default();
        if !self.is_online() {
            report.queued = self.enqueue(runners, legs);
            return report;
        }

        if !runners.is_empty() {
            let count = runners.len();
            if let Err(e) = self.send_runners(runners.clone()).await {
                warn!(error = %e, "Runner push failed, queueing");
                report.queued = self.enqueue(runners, legs);
                return report;
            }
            report.runners = count;
        }
        if !legs.is_empty() {
            let count = legs.len();
            if let Err(e) = self.send_legs(legs.clone()).await {
                warn!(error = %e, "Leg push failed, queueing");
                report.queued = self.enqueue(Vec::new(), legs);
                return report;
            }
            report.legs = count;
        }
        report
    }

    fn enqueue(&self, runners: Vec<Runner>, legs: Vec<Leg>) -> usize {
        let changes: Vec<OfflineChange> = runners
            .into_iter()
            .map(OfflineChange::runner)
            .chain(legs.into_iter().map(OfflineChange::leg))
            .collect();
        let count = changes.len();
        let mut queue = lock(&self.inner.queue);
        for change in changes {
            if let Err(e) = queue.push(change) {
                error!(error = %e, "Failed to persist offline change");
            }
        }
        debug!(count, pending = queue.len(), "Queued changes for later");
        count
    }

    /// Upsert runners and merge the acknowledgements back.
    async fn send_runners(&self, runners: Vec<Runner>) -> Result<()> {
        let rows: Vec<RemoteRunner> = runners.iter().map(RemoteRunner::from_local).collect();
        let remote = Arc::clone(&self.inner.remote);
        let team = self.inner.team.clone();
        let acks = self
            .call("upsert_runners", move |_| {
                let remote = Arc::clone(&remote);
                let team = team.clone();
                let rows = rows.clone();
                async move { remote.upsert_runners(&team, rows).await }
            })
            .await?;

        let acked: Vec<Runner> = acks
            .iter()
            .zip(&runners)
            .map(|(ack, runner)| ack.to_local(runner.id))
            .collect();
        {
            let mut ids = lock(&self.inner.ids);
            for runner in &acked {
                if let Some(remote_id) = &runner.remote_id {
                    ids.remember(remote_id.clone(), runner.id);
                }
            }
        }
        self.remember_names(&acked);

        let events = {
            let mut store = self.inner.store.write().await;
            let local = store.runners().to_vec();
            let mut events = Vec::new();
            merge_acks(
                acked,
                &local,
                |r| r.id,
                |r| r.updated_at,
                |winners| events = store.apply_remote_runners(winners),
            );
            self.persist(&store);
            events
        };
        self.inner.bus.publish_all(events);
        self.signal(Table::Runners).await;
        debug!(count = runners.len(), "Pushed runners");
        Ok(())
    }

    /// Upsert legs and merge the acknowledgements back. Runners the legs point
    /// at that the remote has never seen are pushed first.
    async fn send_legs(&self, legs: Vec<Leg>) -> Result<()> {
        let unsynced: Vec<Runner> = {
            let store = self.inner.store.read().await;
            let mut wanted: Vec<RunnerId> = legs.iter().map(|l| l.runner_id).collect();
            wanted.sort_unstable();
            wanted.dedup();
            wanted
                .into_iter()
                .filter_map(|id| store.runner(id))
                .filter(|r| r.remote_id.is_none())
                .cloned()
                .collect()
        };
        if !unsynced.is_empty() {
            self.send_runners(unsynced).await?;
        }

        let rows: Vec<RemoteLeg> = {
            let store = self.inner.store.read().await;
            legs.iter()
                .map(|leg| {
                    let runner_remote = store.runner(leg.runner_id).and_then(|r| r.remote_id.clone());
                    RemoteLeg::from_local(leg, runner_remote)
                })
                .collect()
        };
        let remote = Arc::clone(&self.inner.remote);
        let team = self.inner.team.clone();
        let acks = self
            .call("upsert_legs", move |_| {
                let remote = Arc::clone(&remote);
                let team = team.clone();
                let rows = rows.clone();
                async move { remote.upsert_legs(&team, rows).await }
            })
            .await?;

        let acked: Vec<Leg> = {
            let ids = lock(&self.inner.ids);
            acks.iter()
                .zip(&legs)
                .map(|(ack, leg)| {
                    let runner_id = ack
                        .runner_id
                        .as_ref()
                        .and_then(|id| ids.local_runner_id(id))
                        .unwrap_or(leg.runner_id);
                    ack.to_local(runner_id)
                })
                .collect()
        };

        let events = {
            let mut store = self.inner.store.write().await;
            let local = store.legs().to_vec();
            let mut events = Vec::new();
            merge_acks(
                acked,
                &local,
                |l| l.id,
                |l| l.updated_at,
                |winners| events = store.apply_remote_legs(winners),
            );
            self.persist(&store);
            events
        };
        self.inner.bus.publish_all(events);
        self.signal(Table::Legs).await;
        debug!(count = legs.len(), "Pushed legs");
        Ok(())
    }

    /// Tell other devices a table changed. Best effort.
    async fn signal(&self, kind: Table) {
        let signal = BroadcastSignal::now(kind, self.inner.device.clone());
        if let Err(e) = self.inner.remote.broadcast(&self.inner.team, signal).await {
            debug!(kind = %kind, error = %e, "Broadcast not sent");
        }
    }

    // ==========================================================================
    // Offline queue
    // ==========================================================================

    /// Replay queued changes in order. Runners are matched remotely by remote
    /// id, then by current name, then by the name the remote last knew; legs
    /// by number. The first failure puts it and everything after it back.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the replay.
    pub async fn replay_offline_queue(&self) -> Result<ReplayReport> {
        if !self.is_online() {
            return Ok(ReplayReport {
                replayed: 0,
                remaining: self.pending_changes(),
            });
        }
        let changes = lock(&self.inner.queue).drain_all()?;
        if changes.is_empty() {
            return Ok(ReplayReport::default());
        }
        info!(count = changes.len(), "Replaying offline queue");

        let needs_lookup = changes
            .iter()
            .any(|c| c.table == Table::Runners && c.remote_id.is_none());
        let remote_runners = if needs_lookup {
            match self.list_remote_runners().await {
                Ok(rows) => rows,
                Err(e) => {
                    self.restore_queue(changes);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let mut replayed = 0;
        let mut changes = changes.into_iter();
        while let Some(change) = changes.next() {
            let result = match &change.payload {
                ChangePayload::Runner(runner) => {
                    let mut runner = runner.clone();
                    if runner.remote_id.is_none() {
                        runner.remote_id = self.resolve_runner_remote_id(&runner, &remote_runners);
                    }
                    self.send_runners(vec![runner]).await
                }
                ChangePayload::Leg(leg) => self.send_legs(vec![leg.clone()]).await,
            };
            if let Err(e) = result {
                let remaining: Vec<OfflineChange> = std::iter::once(change).chain(changes).collect();
                warn!(replayed, remaining = remaining.len(), error = %e, "Offline replay stopped");
                self.restore_queue(remaining);
                return Err(e);
            }
            replayed += 1;
        }
        info!(replayed, "Offline queue replayed");
        Ok(ReplayReport {
            replayed,
            remaining: self.pending_changes(),
        })
    }

    fn restore_queue(&self, changes: Vec<OfflineChange>) {
        if let Err(e) = lock(&self.inner.queue).restore(changes) {
            error!(error = %e, "Failed to persist restored offline changes");
        }
    }

    fn resolve_runner_remote_id(&self, runner: &Runner, remote: &[RemoteRunner]) -> Option<RemoteId> {
        let by_name = |name: &str| {
            remote
                .iter()
                .find(|row| row.name == name)
                .and_then(|row| row.id.clone())
        };
        let previous_name = lock(&self.inner.renames).get(&runner.id).cloned();
        let mapped = remote
            .iter()
            .filter_map(|row| row.id.clone())
            .find(|id| lock(&self.inner.ids).local_runner_id(id) == Some(runner.id));

        mapped
            .or_else(|| by_name(&runner.name))
            .or_else(|| previous_name.as_deref().and_then(by_name))
    }

    fn remember_names(&self, runners: &[Runner]) {
        let mut renames = lock(&self.inner.renames);
        let mut changed = false;
        for runner in runners {
            if renames.get(&runner.id) != Some(&runner.name) {
                renames.insert(runner.id, runner.name.clone());
                changed = true;
            }
        }
        if changed {
            if let Some(storage) = &self.inner.storage {
                if let Err(e) = storage.save_renames(&renames) {
                    warn!(error = %e, "Failed to persist rename map");
                }
            }
        }
    }

    fn persist(&self, store: &LocalRaceStore) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        let meta = PersistedMeta {
            setup_locked: store.metadata().setup_locked,
            last_synced_at: store.metadata().last_synced_at,
        };
        let result = storage
            .save_runners(store.runners())
            .and_then(|()| storage.save_legs(store.legs()))
            .and_then(|()| storage.save_meta(&meta));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist snapshot");
        }
    }

    // ==========================================================================
    // Connectivity
    // ==========================================================================

    pub fn handle_offline(&self) {
        if self.inner.online.swap(false, Ordering::AcqRel) {
            info!(team = %self.inner.team, device = %self.inner.device, "Gone offline");
        }
    }

    /// Back online: reset channels and breakers, replay the queue, push,
    /// refetch and resubscribe. Failures are logged and left to reconciliation.
    pub async fn handle_online(&self) {
        self.inner.online.store(true, Ordering::Release);
        info!(team = %self.inner.team, device = %self.inner.device, "Back online");
        self.reset_trackers(true);
        self.inner.retrier.reset_breakers();

        if let Err(e) = self.replay_offline_queue().await {
            warn!(error = %e, "Replay after reconnect failed");
        }
        let pushed = self.push_pending().await;
        if pushed.queued > 0 {
            warn!(queued = pushed.queued, "Push after reconnect left changes queued");
        }
        if let Err(e) = self.fetch_runners().await {
            warn!(error = %e, "Runner fetch after reconnect failed");
        }
        if let Err(e) = self.fetch_legs().await {
            warn!(error = %e, "Leg fetch after reconnect failed");
        }
        self.start_realtime();
    }

    // ==========================================================================
    // Realtime
    // ==========================================================================

    fn reset_trackers(&self, all: bool) {
        for tracker in lock(&self.inner.trackers).values_mut() {
            if all || !tracker.is_subscribed() {
                tracker.reset();
            }
        }
    }

    fn with_tracker<R>(&self, channel: Channel, f: impl FnOnce(&mut SubscriptionTracker) -> R) -> Option<R> {
        lock(&self.inner.trackers).get_mut(&channel).map(f)
    }

    /// Spawn a listener for every channel that does not have a live one.
    /// Needs a tokio runtime; without one nothing is started.
    pub fn start_realtime(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, realtime not started");
            return;
        };
        let mut tasks = lock(&self.inner.tasks);
        for channel in Channel::ALL {
            if tasks.get(&channel).is_some_and(|task| !task.is_finished()) {
                continue;
            }
            let stop = self.inner.stop.subscribe();
            let task = handle.spawn(self.clone().run_channel(channel, stop));
            tasks.insert(channel, task);
        }
    }

    /// Reset abandoned and retrying channels and rebuild their listeners.
    pub fn retry_realtime(&self) {
        info!(team = %self.inner.team, "Retrying realtime subscriptions");
        self.reset_trackers(false);
        self.start_realtime();
    }

    /// Stop every background task this coordinator started.
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        info!(team = %self.inner.team, device = %self.inner.device, "Sync stopped");
    }

    async fn run_channel(self, channel: Channel, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            if !self.with_tracker(channel, SubscriptionTracker::begin).unwrap_or(false) {
                return;
            }
            let failure = match channel {
                Channel::Runners => self.listen_table(Table::Runners, channel, &mut stop).await,
                Channel::Legs => self.listen_table(Table::Legs, channel, &mut stop).await,
                Channel::Broadcast => self.listen_broadcast(&mut stop).await,
            };
            let Some(failure) = failure else {
                return;
            };
            let Some(delay) = self.with_tracker(channel, |t| t.on_failure(&failure)).flatten() else {
                return;
            };
            tokio::select! {
                _ = stop.changed() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Subscribe with a timeout. `None` means the listener was stopped.
    async fn listen_table(
        &self,
        table: Table,
        channel: Channel,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<ChannelFailure> {
        let subscribe = self.inner.remote.subscribe(table, &self.inner.team);
        let mut rx = match tokio::time::timeout(self.inner.config.subscribe_timeout(), subscribe).await {
            Err(_) => return Some(ChannelFailure::TimedOut),
            Ok(Err(e)) => return Some(ChannelFailure::Error(e.to_string())),
            Ok(Ok(rx)) => rx,
        };
        self.with_tracker(channel, SubscriptionTracker::on_subscribed);

        loop {
            tokio::select! {
                _ = stop.changed() => return None,
                message = rx.recv() => match message {
                    Ok(notification) => {
                        debug!(table = %notification.table, event = ?notification.event_type, "Change notification");
                        self.schedule_refetch(notification.table);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(table = %table, skipped, "Notifications lagged");
                        self.schedule_refetch(table);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Some(ChannelFailure::Closed),
                },
            }
        }
    }

    async fn listen_broadcast(&self, stop: &mut watch::Receiver<bool>) -> Option<ChannelFailure> {
        let subscribe = self.inner.remote.subscribe_broadcast(&self.inner.team);
        let mut rx = match tokio::time::timeout(self.inner.config.subscribe_timeout(), subscribe).await {
            Err(_) => return Some(ChannelFailure::TimedOut),
            Ok(Err(e)) => return Some(ChannelFailure::Error(e.to_string())),
            Ok(Ok(rx)) => rx,
        };
        self.with_tracker(Channel::Broadcast, SubscriptionTracker::on_subscribed);

        loop {
            tokio::select! {
                _ = stop.changed() => return None,
                message = rx.recv() => match message {
                    Ok(signal) => {
                        if lock(&self.inner.dedup).should_process(&signal, Instant::now()) {
                            self.schedule_refetch(signal.kind);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.schedule_refetch(Table::Runners);
                        self.schedule_refetch(Table::Legs);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Some(ChannelFailure::Closed),
                },
            }
        }
    }

    /// Refetch `table` after the debounce window. Requests made while one is
    /// scheduled are coalesced into it.
    pub fn schedule_refetch(&self, table: Table) {
        match table {
            Table::Runners => self.inner.pending_runners.store(true, Ordering::Release),
            Table::Legs => self.inner.pending_legs.store(true, Ordering::Release),
        }
        if self.inner.refetch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.refetch_scheduled.store(false, Ordering::Release);
            return;
        };
        let this = self.clone();
        let mut stop = self.inner.stop.subscribe();
        let debounce = self.inner.config.debounce();
        handle.spawn(async move {
            tokio::select! {
                _ = stop.changed() => {
                    this.inner.refetch_scheduled.store(false, Ordering::Release);
                    return;
                }
                () = tokio::time::sleep(debounce) => {}
            }
            this.inner.refetch_scheduled.store(false, Ordering::Release);
            this.run_pending_refetch().await;
        });
    }

    async fn run_pending_refetch(&self) {
        if self.inner.pending_runners.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.fetch_runners().await {
                warn!(error = %e, "Debounced runner refetch failed");
            }
        }
        if self.inner.pending_legs.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.fetch_legs().await {
                warn!(error = %e, "Debounced leg refetch failed");
            }
        }
    }
}

/// Parts loaded from a team directory.
#[derive(Default)]
struct PersistedParts {
    storage: Option<TeamStorage>,
    queue: OfflineQueue,
    renames: RenameMap,
    ids: IdMapper,
}

/// Bus subscriber that turns local edits into pushes. Holds the coordinator
/// weakly so the bus does not keep it alive.
struct PushTrigger {
    inner: Weak<Inner>,
}

#[async_trait]
impl EventHandler for PushTrigger {
    async fn handle(&self, event: &RaceEvent) -> baton_events::Result<()> {
        if !event.is_local() {
            return Ok(());
        }
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let coordinator = SyncCoordinator { inner };
        coordinator.mark_event_dirty(event).await;
        let report = coordinator.push_pending().await;
        debug!(
            runners = report.runners,
            legs = report.legs,
            queued = report.queued,
            "Pushed local edit"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "sync"
    }
}
