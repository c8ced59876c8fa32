//! In-memory remote store.
//!
//! Behaves like the hosted backend where it matters to sync: natural-key
//! upserts, server-side last-write-wins, change notifications per table and
//! a device broadcast channel. Connectivity and subscription failures can be
//! injected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use baton_core::{RemoteId, TeamId};
use baton_store::Table;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::remote::{
    BroadcastSignal, ChangeNotification, ChangeType, RemoteLeg, RemoteRecord, RemoteRunner,
    RemoteStore,
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct TeamTables {
    runners: Vec<RemoteRunner>,
    legs: Vec<RemoteLeg>,
}

#[derive(Debug)]
struct TeamChannels {
    runners: broadcast::Sender<ChangeNotification>,
    legs: broadcast::Sender<ChangeNotification>,
    signals: broadcast::Sender<BroadcastSignal>,
}

impl TeamChannels {
    fn new() -> Self {
        Self {
            runners: broadcast::channel(CHANNEL_CAPACITY).0,
            legs: broadcast::channel(CHANNEL_CAPACITY).0,
            signals: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    const fn table(&self, table: Table) -> &broadcast::Sender<ChangeNotification> {
        match table {
            Table::Runners => &self.runners,
            Table::Legs => &self.legs,
        }
    }
}

fn new_remote_id() -> RemoteId {
    RemoteId::new(Uuid::new_v4().to_string())
}

/// Remote store held in process memory.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    tables: Mutex<HashMap<TeamId, TeamTables>>,
    channels: Mutex<HashMap<TeamId, TeamChannels>>,
    online: AtomicBool,
    failing_subscribes: AtomicU32,
    requests: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            failing_subscribes: AtomicU32::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Take the store off or back on the network. Going offline closes every
    /// open channel.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        info!(online, "Remote store connectivity changed");
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Requests served so far, including failed ones.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Snapshot of a team's runner rows.
    pub fn runners(&self, team: &TeamId) -> Vec<RemoteRunner> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(team)
            .map(|t| t.runners.clone())
            .unwrap_or_default()
    }

    /// Snapshot of a team's leg rows.
    pub fn legs(&self, team: &TeamId) -> Vec<RemoteLeg> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(team)
            .map(|t| t.legs.clone())
            .unwrap_or_default()
    }

    fn begin_request(&self, operation: &str) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.is_online() {
            debug!(operation, "Remote request");
            Ok(())
        } else {
            Err(SyncError::Offline)
        }
    }

    fn notify(&self, team: &TeamId, notifications: Vec<ChangeNotification>) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(team_channels) = channels.get(team) else {
            return;
        };
        for notification in notifications {
            // No receivers is fine.
            let _ = team_channels.table(notification.table).send(notification);
        }
    }

    fn with_tables<R>(&self, team: &TeamId, f: impl FnOnce(&mut TeamTables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(tables.entry(team.clone()).or_default())
    }
}

/// Upsert one runner row: match by id, then by name; the newer `updated_at` wins.
fn upsert_runner(rows: &mut Vec<RemoteRunner>, incoming: RemoteRunner) -> (RemoteRunner, Option<ChangeNotification>) {
    let position = incoming
        .id
        .as_ref()
        .and_then(|id| rows.iter().position(|r| r.id.as_ref() == Some(id)))
        .or_else(|| rows.iter().position(|r| r.name == incoming.name));

    match position.and_then(|index| rows.get_mut(index)) {
        None => {
            let mut row = incoming;
            row.id = row.id.or_else(|| Some(new_remote_id()));
            row.updated_at = row.updated_at.or_else(|| Some(Utc::now()));
            rows.push(row.clone());
            let notification = ChangeNotification {
                table: Table::Runners,
                event_type: ChangeType::Insert,
                old: None,
                new: Some(RemoteRecord::Runner(row.clone())),
            };
            (row, Some(notification))
        }
        Some(existing) if incoming.updated_at > existing.updated_at => {
            let old = existing.clone();
            let mut row = incoming;
            row.id = old.id.clone();
            *existing = row.clone();
            let notification = ChangeNotification {
                table: Table::Runners,
                event_type: ChangeType::Update,
                old: Some(RemoteRecord::Runner(old)),
                new: Some(RemoteRecord::Runner(row.clone())),
            };
            (row, Some(notification))
        }
        Some(existing) => (existing.clone(), None),
    }
}

/// Upsert one leg row: match by id, then by number; the newer `updated_at` wins.
fn upsert_leg(rows: &mut Vec<RemoteLeg>, incoming: RemoteLeg) -> (RemoteLeg, Option<ChangeNotification>) {
    let position = incoming
        .id
        .as_ref()
        .and_then(|id| rows.iter().position(|l| l.id.as_ref() == Some(id)))
        .or_else(|| rows.iter().position(|l| l.number == incoming.number));

    match position.and_then(|index| rows.get_mut(index)) {
        None => {
            let mut row = incoming;
            row.id = row.id.or_else(|| Some(new_remote_id()));
            row.updated_at = row.updated_at.or_else(|| Some(Utc::now()));
            rows.push(row.clone());
            rows.sort_by_key(|l| l.number);
            let notification = ChangeNotification {
                table: Table::Legs,
                event_type: ChangeType::Insert,
                old: None,
                new: Some(RemoteRecord::Leg(row.clone())),
            };
            (row, Some(notification))
        }
        Some(existing) if incoming.updated_at > existing.updated_at => {
            let old = existing.clone();
            let mut row = incoming;
            row.id = old.id.clone();
            *existing = row.clone();
            let notification = ChangeNotification {
                table: Table::Legs,
                event_type: ChangeType::Update,
                old: Some(RemoteRecord::Leg(old)),
                new: Some(RemoteRecord::Leg(row.clone())),
            };
            (row, Some(notification))
        }
        Some(existing) => (existing.clone(), None),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn list_runners(&self, team: &TeamId) -> Result<Vec<RemoteRunner>> {
        self.begin_request("list_runners")?;
        Ok(self.runners(team))
    }

    async fn list_legs(&self, team: &TeamId) -> Result<Vec<RemoteLeg>> {
        self.begin_request("list_legs")?;
        Ok(self.legs(team))
    }

    async fn upsert_runners(
        &self,
        team: &TeamId,
        runners: Vec<RemoteRunner>,
    ) -> Result<Vec<RemoteRunner>> {
        self.begin_request("upsert_runners")?;
        let (acks, notifications): (Vec<_>, Vec<_>) = self.with_tables(team, |tables| {
            runners
                .into_iter()
                .map(|runner| upsert_runner(&mut tables.runners, runner))
                .unzip()
        });
        self.notify(team, notifications.into_iter().flatten().collect());
        Ok(acks)
    }

    async fn upsert_legs(&self, team: &TeamId, legs: Vec<RemoteLeg>) -> Result<Vec<RemoteLeg>> {
        self.begin_request("upsert_legs")?;
        let (acks, notifications): (Vec<_>, Vec<_>) = self.with_tables(team, |tables| {
            legs.into_iter()
                .map(|leg| upsert_leg(&mut tables.legs, leg))
                .unzip()
        });
        self.notify(team, notifications.into_iter().flatten().collect());
        Ok(acks)
    }

    async fn subscribe(
        &self,
        table: Table,
        team: &TeamId,
    ) -> Result<broadcast::Receiver<ChangeNotification>> {
        self.begin_request("subscribe")?;
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::subscribe_failed(table.to_string(), "injected failure"));
        }
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(channels
            .entry(team.clone())
            .or_insert_with(TeamChannels::new)
            .table(table)
            .subscribe())
    }

    async fn subscribe_broadcast(
        &self,
        team: &TeamId,
    ) -> Result<broadcast::Receiver<BroadcastSignal>> {
        self.begin_request("subscribe_broadcast")?;
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::subscribe_failed("broadcast", "injected failure"));
        }
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(channels
            .entry(team.clone())
            .or_insert_with(TeamChannels::new)
            .signals
            .subscribe())
    }

    async fn broadcast(&self, team: &TeamId, signal: BroadcastSignal) -> Result<()> {
        self.begin_request("broadcast")?;
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(team_channels) = channels.get(team) {
            let _ = team_channels.signals.send(signal);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use baton_core::Van;
    use chrono::Duration;

    use super::*;

    fn runner(name: &str, at: chrono::DateTime<Utc>) -> RemoteRunner {
        RemoteRunner {
            id: None,
            name: name.to_string(),
            pace: 500,
            van: Van::One,
            updated_at: Some(at),
        }
    }

    #[tokio::test]
    async fn should_assign_ids_and_upsert_by_name() {
        let remote = InMemoryRemoteStore::new();
        let team = TeamId::from("t");
        let now = Utc::now();

        let first = remote.upsert_runners(&team, vec![runner("Ana", now)]).await.unwrap();
        let mut again = runner("Ana", now + Duration::seconds(1));
        again.pace = 450;
        let second = remote.upsert_runners(&team, vec![again]).await.unwrap();

        assert!(first[0].id.is_some());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(remote.runners(&team).len(), 1);
        assert_eq!(remote.runners(&team)[0].pace, 450);
    }

    #[tokio::test]
    async fn should_keep_newer_row_and_ack_it() {
        let remote = InMemoryRemoteStore::new();
        let team = TeamId::from("t");
        let now = Utc::now();
        remote.upsert_runners(&team, vec![runner("Ana", now)]).await.unwrap();

        let mut stale = runner("Ana", now - Duration::seconds(5));
        stale.pace = 999;
        let ack = remote.upsert_runners(&team, vec![stale]).await.unwrap();

        assert_eq!(ack[0].pace, 500);
        assert_eq!(ack[0].updated_at, Some(now));
    }

    #[tokio::test]
    async fn should_notify_subscribers_of_changes() {
        let remote = InMemoryRemoteStore::new();
        let team = TeamId::from("t");
        let mut rx = remote.subscribe(Table::Runners, &team).await.unwrap();

        remote.upsert_runners(&team, vec![runner("Ana", Utc::now())]).await.unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event_type, ChangeType::Insert);
        assert_eq!(notification.table, Table::Runners);
    }

    #[tokio::test]
    async fn should_refuse_requests_and_close_channels_when_offline() {
        let remote = InMemoryRemoteStore::new();
        let team = TeamId::from("t");
        let mut rx = remote.subscribe(Table::Legs, &team).await.unwrap();

        remote.set_online(false);

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(remote.list_runners(&team).await, Err(SyncError::Offline));
    }

    #[tokio::test]
    async fn should_fail_injected_subscribes_then_recover() {
        let remote = InMemoryRemoteStore::new();
        let team = TeamId::from("t");
        remote.fail_next_subscribes(1);

        assert!(remote.subscribe(Table::Runners, &team).await.is_err());
        assert!(remote.subscribe(Table::Runners, &team).await.is_ok());
    }
}
