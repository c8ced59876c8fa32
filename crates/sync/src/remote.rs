//! The remote record store seam.
//!
//! The remote store keeps one row per runner and per leg for each team,
//! upserts idempotently on a natural key, and pushes change notifications
//! over realtime channels.

use async_trait::async_trait;
use baton_core::{DeviceId, Leg, LegId, RemoteId, Runner, RunnerId, TeamId, Timestamp, Van};
use baton_store::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Runner row as stored remotely. The natural key is the name within a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRunner {
    /// Assigned by the remote store on first insert.
    pub id: Option<RemoteId>,
    pub name: String,
    pub pace: u32,
    pub van: Van,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRunner {
    pub fn from_local(runner: &Runner) -> Self {
        Self {
            id: runner.remote_id.clone(),
            name: runner.name.clone(),
            pace: runner.pace,
            van: runner.van,
            updated_at: runner.updated_at,
        }
    }

    /// The local runner this row describes once mapped to `local_id`.
    pub fn to_local(&self, local_id: RunnerId) -> Runner {
        Runner {
            id: local_id,
            remote_id: self.id.clone(),
            name: self.name.clone(),
            pace: self.pace,
            van: self.van,
            updated_at: self.updated_at,
        }
    }
}

/// Leg row as stored remotely. The natural key is the leg number within a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLeg {
    pub id: Option<RemoteId>,
    pub number: LegId,
    /// Remote id of the assigned runner.
    pub runner_id: Option<RemoteId>,
    pub distance: f64,
    pub actual_start: Option<Timestamp>,
    pub actual_finish: Option<Timestamp>,
    pub pace_override: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteLeg {
    pub fn from_local(leg: &Leg, runner_remote_id: Option<RemoteId>) -> Self {
        Self {
            id: leg.remote_id.clone(),
            number: leg.id,
            runner_id: runner_remote_id,
            distance: leg.distance,
            actual_start: leg.actual_start,
            actual_finish: leg.actual_finish,
            pace_override: leg.pace_override,
            updated_at: leg.updated_at,
        }
    }

    /// The local leg this row describes, assigned to `runner_id`. Projections
    /// are left at zero for the store to derive.
    pub fn to_local(&self, runner_id: RunnerId) -> Leg {
        let mut leg = Leg::new(self.number, runner_id, self.distance);
        leg.actual_start = self.actual_start;
        leg.actual_finish = self.actual_finish;
        leg.pace_override = self.pace_override;
        leg.remote_id = self.id.clone();
        leg.updated_at = self.updated_at;
        leg
    }
}

/// A remote row in either table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum RemoteRecord {
    Runner(RemoteRunner),
    Leg(RemoteLeg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Row-level change pushed on a table channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: Table,
    pub event_type: ChangeType,
    pub old: Option<RemoteRecord>,
    pub new: Option<RemoteRecord>,
}

/// Device-to-device hint that a table changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSignal {
    pub kind: Table,
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastSignal {
    pub fn now(kind: Table, device_id: DeviceId) -> Self {
        Self {
            kind,
            device_id,
            timestamp: Utc::now(),
        }
    }
}

/// Remote record store reachable over RPC with realtime notifications.
///
/// Upserts are idempotent on the natural key and resolve concurrent writes
/// by last-write-wins on `updated_at`; the acknowledgement carries the row
/// that was kept.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_runners(&self, team: &TeamId) -> Result<Vec<RemoteRunner>>;

    async fn list_legs(&self, team: &TeamId) -> Result<Vec<RemoteLeg>>;

    async fn upsert_runners(
        &self,
        team: &TeamId,
        runners: Vec<RemoteRunner>,
    ) -> Result<Vec<RemoteRunner>>;

    async fn upsert_legs(&self, team: &TeamId, legs: Vec<RemoteLeg>) -> Result<Vec<RemoteLeg>>;

    /// Open a change channel for one table.
    async fn subscribe(
        &self,
        table: Table,
        team: &TeamId,
    ) -> Result<broadcast::Receiver<ChangeNotification>>;

    /// Open the device broadcast channel.
    async fn subscribe_broadcast(
        &self,
        team: &TeamId,
    ) -> Result<broadcast::Receiver<BroadcastSignal>>;

    async fn broadcast(&self, team: &TeamId, signal: BroadcastSignal) -> Result<()>;
}
