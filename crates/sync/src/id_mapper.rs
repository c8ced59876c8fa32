//! Stable mapping from remote record ids to local ids.
//!
//! Local runner ids are roster slots (1..=12) and must not reshuffle between
//! fetches, or every leg assignment would point at the wrong person.

use std::collections::{HashMap, HashSet};

use baton_core::{Leg, RemoteId, Runner, RunnerId, RUNNER_COUNT};
use tracing::{debug, warn};

use crate::remote::{RemoteLeg, RemoteRunner};

#[derive(Debug, Clone, Default)]
pub struct IdMapper {
    runners: HashMap<RemoteId, RunnerId>,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mapping from runners that already carry remote ids.
    pub fn from_runners(runners: &[Runner]) -> Self {
        let mut mapper = Self::new();
        for runner in runners {
            if let Some(remote_id) = &runner.remote_id {
                mapper.remember(remote_id.clone(), runner.id);
            }
        }
        mapper
    }

    pub fn local_runner_id(&self, remote_id: &RemoteId) -> Option<RunnerId> {
        self.runners.get(remote_id).copied()
    }

    pub fn remember(&mut self, remote_id: RemoteId, local_id: RunnerId) {
        if self.runners.insert(remote_id.clone(), local_id) != Some(local_id) {
            debug!(remote_id = %remote_id, local_id, "Mapped runner id");
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Resolve each remote runner to a local slot: the previous mapping, then
    /// a local runner with the same remote id, then one with the same name,
    /// then the lowest slot with no remote id. No slot is used twice. Rows
    /// that cannot be placed are skipped.
    pub fn map_runners(&mut self, remote: &[RemoteRunner], local: &[Runner]) -> Vec<Runner> {
        let mut claimed: HashSet<RunnerId> = HashSet::new();
        let mut mapped = Vec::with_capacity(remote.len());

        for row in remote {
            let free = |id: &RunnerId| !claimed.contains(id);
            let previous = row
                .id
                .as_ref()
                .and_then(|id| self.local_runner_id(id))
                .filter(free);
            let by_remote_id = || {
                row.id.as_ref().and_then(|id| {
                    local
                        .iter()
                        .find(|r| r.remote_id.as_ref() == Some(id))
                        .map(|r| r.id)
                        .filter(free)
                })
            };
            let by_name = || {
                local
                    .iter()
                    .find(|r| r.name == row.name && free(&r.id))
                    .map(|r| r.id)
            };
            let lowest_unmapped = || {
                let mut candidates: Vec<RunnerId> = local
                    .iter()
                    .filter(|r| r.remote_id.is_none() && free(&r.id))
                    .map(|r| r.id)
                    .collect();
                candidates.sort_unstable();
                candidates.first().copied()
            };

            let Some(local_id) = previous
                .or_else(by_remote_id)
                .or_else(by_name)
                .or_else(lowest_unmapped)
            else {
                warn!(name = %row.name, remote_id = ?row.id, "No local slot for remote runner");
                continue;
            };

            claimed.insert(local_id);
            if let Some(id) = &row.id {
                self.remember(id.clone(), local_id);
            }
            mapped.push(row.to_local(local_id));
        }
        mapped
    }

    /// Convert remote legs to local ones. The runner is resolved through the
    /// mapping, falling back to the local leg's runner and then the rotation.
    pub fn map_legs(&self, remote: &[RemoteLeg], local: &[Leg]) -> Vec<Leg> {
        remote
            .iter()
            .map(|row| {
                let runner_id = row
                    .runner_id
                    .as_ref()
                    .and_then(|id| self.local_runner_id(id))
                    .or_else(|| local.iter().find(|l| l.id == row.number).map(|l| l.runner_id))
                    .unwrap_or_else(|| rotation_runner(row.number));
                row.to_local(runner_id)
            })
            .collect()
    }
}

/// Default runner for a leg number: legs rotate through the roster.
fn rotation_runner(leg_number: u32) -> RunnerId {
    let count = u32::try_from(RUNNER_COUNT).unwrap_or(u32::MAX);
    leg_number.saturating_sub(1) % count + 1
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use baton_core::{default_runners, Van};

    use super::*;

    fn remote_runner(id: &str, name: &str) -> RemoteRunner {
        RemoteRunner {
            id: Some(RemoteId::from(id)),
            name: name.to_string(),
            pace: 480,
            van: Van::One,
            updated_at: None,
        }
    }

    #[test]
    fn should_keep_previous_mapping_across_fetches() {
        let mut mapper = IdMapper::new();
        let local = default_runners();
        let rows = vec![remote_runner("a", "Ana"), remote_runner("b", "Ben")];

        let first: Vec<RunnerId> = mapper.map_runners(&rows, &local).iter().map(|r| r.id).collect();
        let reversed: Vec<RemoteRunner> = rows.into_iter().rev().collect();
        let second: Vec<RunnerId> = mapper.map_runners(&reversed, &local).iter().map(|r| r.id).collect();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![2, 1]);
    }

    #[test]
    fn should_match_by_name_before_free_slot() {
        let mut mapper = IdMapper::new();
        let local = default_runners();

        let mapped = mapper.map_runners(&[remote_runner("x", "Runner 5")], &local);

        assert_eq!(mapped[0].id, 5);
        assert_eq!(mapper.local_runner_id(&RemoteId::from("x")), Some(5));
    }

    #[test]
    fn should_prefer_local_runner_with_same_remote_id() {
        let mut local = default_runners();
        local[8].remote_id = Some(RemoteId::from("r9"));
        let mut mapper = IdMapper::new();

        let mapped = mapper.map_runners(&[remote_runner("r9", "Renamed")], &local);

        assert_eq!(mapped[0].id, 9);
        assert_eq!(mapped[0].name, "Renamed");
    }

    #[test]
    fn should_never_assign_a_slot_twice() {
        let mut mapper = IdMapper::new();
        let local = default_runners();
        let rows = vec![remote_runner("a", "Runner 1"), remote_runner("b", "Runner 1")];

        let ids: Vec<RunnerId> = mapper.map_runners(&rows, &local).iter().map(|r| r.id).collect();

        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn should_resolve_leg_runner_through_mapping() {
        let mut mapper = IdMapper::new();
        mapper.remember(RemoteId::from("r3"), 3);
        let row = RemoteLeg {
            id: Some(RemoteId::from("leg-14")),
            number: 14,
            runner_id: Some(RemoteId::from("r3")),
            distance: 4.0,
            actual_start: None,
            actual_finish: None,
            pace_override: None,
            updated_at: None,
        };
        let unknown = RemoteLeg {
            number: 15,
            runner_id: Some(RemoteId::from("nobody")),
            ..row.clone()
        };

        let legs = mapper.map_legs(&[row, unknown], &[]);

        assert_eq!(legs[0].runner_id, 3);
        assert_eq!(legs[1].runner_id, 3);
    }
}
