//! Ordered queue of changes made while the remote store was unreachable.

use std::fmt;

use baton_core::{Leg, LegId, RemoteId, Result, Runner, RunnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::TeamStorage;

/// Remote table a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Runners,
    Legs,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runners => f.write_str("runners"),
            Self::Legs => f.write_str("legs"),
        }
    }
}

/// Full record to upsert when the change is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum ChangePayload {
    Runner(Runner),
    Leg(Leg),
}

/// One queued upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineChange {
    pub table: Table,
    /// Runner id or leg number.
    pub local_id: u32,
    pub remote_id: Option<RemoteId>,
    pub payload: ChangePayload,
    pub timestamp: DateTime<Utc>,
}

impl OfflineChange {
    pub fn runner(runner: Runner) -> Self {
        Self {
            table: Table::Runners,
            local_id: runner.id,
            remote_id: runner.remote_id.clone(),
            timestamp: runner.updated_at.unwrap_or_else(Utc::now),
            payload: ChangePayload::Runner(runner),
        }
    }

    pub fn leg(leg: Leg) -> Self {
        Self {
            table: Table::Legs,
            local_id: leg.id,
            remote_id: leg.remote_id.clone(),
            timestamp: leg.updated_at.unwrap_or_else(Utc::now),
            payload: ChangePayload::Leg(leg),
        }
    }

    pub const fn runner_id(&self) -> Option<RunnerId> {
        match self.table {
            Table::Runners => Some(self.local_id),
            Table::Legs => None,
        }
    }

    pub const fn leg_id(&self) -> Option<LegId> {
        match self.table {
            Table::Legs => Some(self.local_id),
            Table::Runners => None,
        }
    }
}

/// FIFO of [`OfflineChange`]s, written through to [`TeamStorage`] when attached.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    changes: Vec<OfflineChange>,
    storage: Option<TeamStorage>,
}

impl OfflineQueue {
    /// Queue that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Queue backed by the team's `offline_queue.json`, loading what is already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing queue file cannot be read.
    pub fn persistent(storage: TeamStorage) -> Result<Self> {
        let changes = storage.load_queue()?;
        debug!(pending = changes.len(), "Loaded offline queue");
        Ok(Self {
            changes,
            storage: Some(storage),
        })
    }

    /// Append a change.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written through to disk.
    pub fn push(&mut self, change: OfflineChange) -> Result<()> {
        debug!(table = %change.table, local_id = change.local_id, "Queued offline change");
        self.changes.push(change);
        self.flush()
    }

    pub fn pending(&self) -> &[OfflineChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Take every queued change, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the emptied queue cannot be written through to disk.
    pub fn drain_all(&mut self) -> Result<Vec<OfflineChange>> {
        let drained = std::mem::take(&mut self.changes);
        self.flush()?;
        Ok(drained)
    }

    /// Put changes back at the front, ahead of anything queued since they were drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written through to disk.
    pub fn restore(&mut self, mut changes: Vec<OfflineChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        changes.append(&mut self.changes);
        self.changes = changes;
        self.flush()
    }

    /// # Errors
    ///
    /// Returns an error if the emptied queue cannot be written through to disk.
    pub fn clear(&mut self) -> Result<()> {
        self.changes.clear();
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.save_queue(&self.changes),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use baton_core::TeamId;

    use super::*;

    #[test]
    fn should_preserve_order_and_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let team = TeamId::from("relay");
        let mut queue = OfflineQueue::persistent(TeamStorage::open(tmp.path(), &team).unwrap()).unwrap();

        queue.push(OfflineChange::runner(Runner::placeholder(2))).unwrap();
        queue.push(OfflineChange::leg(Leg::new(5, 2, 4.2))).unwrap();

        let reopened = OfflineQueue::persistent(TeamStorage::open(tmp.path(), &team).unwrap()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.pending()[0].runner_id(), Some(2));
        assert_eq!(reopened.pending()[1].leg_id(), Some(5));
    }

    #[test]
    fn should_restore_failed_changes_ahead_of_new_ones() {
        let mut queue = OfflineQueue::in_memory();
        queue.push(OfflineChange::runner(Runner::placeholder(1))).unwrap();
        queue.push(OfflineChange::runner(Runner::placeholder(2))).unwrap();

        let drained = queue.drain_all().unwrap();
        assert!(queue.is_empty());
        queue.push(OfflineChange::runner(Runner::placeholder(3))).unwrap();
        queue.restore(drained).unwrap();

        let ids: Vec<u32> = queue.pending().iter().map(|c| c.local_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        queue.clear().unwrap();
        assert_eq!(queue.len(), 0);
    }
}
