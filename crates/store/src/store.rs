//! The authoritative local race snapshot.
//!
//! Every mutation clones the state, applies the edit, re-projects the
//! schedule and swaps the result in, then returns the events the mutation
//! implies. The store never publishes anything itself.

use baton_core::{
    Error, Leg, LegId, RaceConfig, RaceState, Result, Runner, RunnerId, TeamId,
    Timestamp, RUNNER_COUNT,
};
use baton_events::{Origin, RaceEvent, RacePayload};
use baton_projection::{
    auto_start_next_leg, detect_and_repair_impossible_leg_states, is_race_finished,
    ProjectionCalculator, RaceCursor,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::effects::{leg_update_events, transition_events};
use crate::roster::{is_roster_id, normalize_roster, reassign_orphaned_legs};

/// Sync bookkeeping kept beside the race state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetadata {
    pub team_id: Option<TeamId>,
    pub setup_complete: bool,
    /// Set once any remote runner exists; setup can no longer overwrite data.
    pub setup_locked: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result of [`LocalRaceStore::fix_data_inconsistencies`].
#[derive(Debug, Clone, Default)]
pub struct FixReport {
    pub changed: bool,
    pub changes: Vec<String>,
    /// Violations left in place for a manual correction.
    pub unresolved: Vec<String>,
    pub events: Vec<RaceEvent>,
}

/// Update time for a locally edited record, strictly after its previous stamp.
fn stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// Local race state for one team.
#[derive(Debug, Default)]
pub struct LocalRaceStore {
    state: RaceState,
    meta: SyncMetadata,
    calculator: ProjectionCalculator,
    generation: u64,
}

impl LocalRaceStore {
    pub fn new(calculator: ProjectionCalculator) -> Self {
        Self {
            state: RaceState::default(),
            meta: SyncMetadata::default(),
            calculator,
            generation: 0,
        }
    }

    pub fn from_config(config: &RaceConfig) -> Self {
        Self::new(ProjectionCalculator::from_config(config))
    }

    #[must_use]
    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.meta.team_id = Some(team_id);
        self
    }

    // ==========================================================================
    // Queries
    // ==========================================================================

    pub fn state(&self) -> &RaceState {
        &self.state
    }

    pub fn runners(&self) -> &[Runner] {
        &self.state.runners
    }

    pub fn legs(&self) -> &[Leg] {
        &self.state.legs
    }

    pub fn runner(&self, id: RunnerId) -> Option<&Runner> {
        self.state.runner(id)
    }

    pub fn leg(&self, id: LegId) -> Option<&Leg> {
        self.state.leg(id)
    }

    pub fn metadata(&self) -> &SyncMetadata {
        &self.meta
    }

    pub fn calculator(&self) -> &ProjectionCalculator {
        &self.calculator
    }

    /// Bumped on every committed mutation.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cursor(&self) -> RaceCursor {
        self.calculator.cursor(self.generation, &self.state.legs)
    }

    pub fn current_leg(&self) -> Option<&Leg> {
        self.cursor().current.and_then(|id| self.leg(id))
    }

    pub fn next_leg(&self) -> Option<&Leg> {
        self.cursor().next.and_then(|id| self.leg(id))
    }

    // ==========================================================================
    // Metadata
    // ==========================================================================

    pub fn set_team(&mut self, team_id: TeamId) {
        self.meta.team_id = Some(team_id);
    }

    pub fn set_setup_locked(&mut self, locked: bool) {
        if locked && !self.meta.setup_locked {
            info!("Setup locked: remote data exists");
        }
        self.meta.setup_locked = locked;
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.meta.last_synced_at = Some(at);
    }

    // ==========================================================================
    // Commit
    // ==========================================================================

    /// Re-project `next` from `from_index`, swap it in and bump the generation.
    fn commit(&mut self, mut next: RaceState, from_index: usize) {
        self.calculator
            .recalculate_projections(&mut next.legs, from_index, &next.runners, next.start_time);
        self.state = next;
        self.generation = self.generation.wrapping_add(1);
        self.calculator.invalidate_cursor();
        debug!(generation = self.generation, from_index, "Committed race state");
    }

    /// Commit a leg edit and derive its events.
    fn commit_legs(&mut self, next: RaceState, from_index: usize, origin: Origin) -> Vec<RaceEvent> {
        let before = self.state.legs.clone();
        self.commit(next, from_index);
        let mut events = leg_update_events(&before, &self.state.legs, origin);
        events.extend(transition_events(&before, &self.state.legs, origin));
        events
    }

    fn leg_position(&self, leg_id: LegId) -> Result<usize> {
        if !self.state.is_initialized() {
            return Err(Error::RaceNotInitialized);
        }
        self.state
            .leg_index(leg_id)
            .ok_or(Error::LegNotFound { id: leg_id })
    }

    fn runner_position(&self, runner_id: RunnerId) -> Result<usize> {
        self.state
            .runners
            .iter()
            .position(|r| r.id == runner_id)
            .ok_or(Error::RunnerNotFound { id: runner_id })
    }

    // ==========================================================================
    // Bulk
    // ==========================================================================

    /// Replace the start time, roster and legs wholesale.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` when `legs` is neither empty nor a full race.
    pub fn set_race_data(
        &mut self,
        start_time: Option<Timestamp>,
        runners: Vec<Runner>,
        mut legs: Vec<Leg>,
    ) -> Result<Vec<RaceEvent>> {
        if !legs.is_empty() && legs.len() != self.calculator.leg_count() {
            return Err(Error::invalid_record(format!(
                "expected {} legs, got {}",
                self.calculator.leg_count(),
                legs.len()
            )));
        }
        let (runners, replaced) = normalize_roster(&runners);
        for change in &replaced {
            warn!(change = %change, "Normalized roster");
        }
        legs.sort_by_key(|l| l.id);
        let reassigned = reassign_orphaned_legs(&mut legs, &runners);
        for change in &reassigned {
            warn!(change = %change, "Normalized legs");
        }

        let before = self.state.legs.clone();
        self.commit(
            RaceState {
                start_time,
                runners,
                legs,
            },
            0,
        );
        info!(legs = self.state.legs.len(), "Race data replaced");

        let mut events = vec![RaceEvent::local(RacePayload::RaceDataReplaced)];
        events.extend(transition_events(&before, &self.state.legs, Origin::Local));
        Ok(events)
    }

    /// Adopt persisted snapshots without producing any events.
    pub fn restore_snapshot(&mut self, runners: Vec<Runner>, legs: Vec<Leg>) {
        let (runners, _) = normalize_roster(&runners);
        let legs = if legs.len() == self.calculator.leg_count() {
            legs
        } else {
            Vec::new()
        };
        let start_time = self.state.start_time;
        self.commit(
            RaceState {
                start_time,
                runners,
                legs,
            },
            0,
        );
    }

    // ==========================================================================
    // Runners
    // ==========================================================================

    /// Insert or replace a runner by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` for an id outside the roster or a zero pace.
    pub fn upsert_runner(&mut self, mut runner: Runner) -> Result<Vec<RaceEvent>> {
        if !is_roster_id(runner.id) || !runner.is_valid() {
            return Err(Error::invalid_record(format!(
                "runner {} must have an id in 1..={RUNNER_COUNT} and a positive pace",
                runner.id
            )));
        }
        let position = self.runner_position(runner.id)?;
        let mut next = self.state.clone();
        let previous = next.runners.get(position).and_then(|r| r.updated_at);
        if runner.remote_id.is_none() {
            runner.remote_id = next.runners.get(position).and_then(|r| r.remote_id.clone());
        }
        runner.updated_at = Some(stamp(previous));
        if let Some(slot) = next.runners.get_mut(position) {
            *slot = runner.clone();
        }
        self.commit(next, 0);
        debug!(runner_id = runner.id, "Runner upserted");
        Ok(vec![RaceEvent::local(RacePayload::RunnerUpdated { runner })])
    }

    /// Replace a runner by its placeholder; the roster always keeps 12 slots.
    ///
    /// # Errors
    ///
    /// Returns `Error::RunnerNotFound` for an unknown id.
    pub fn delete_runner(&mut self, id: RunnerId) -> Result<Vec<RaceEvent>> {
        let position = self.runner_position(id)?;
        let mut next = self.state.clone();
        let Some(slot) = next.runners.get_mut(position) else {
            return Err(Error::RunnerNotFound { id });
        };
        let mut placeholder = Runner::placeholder(id);
        placeholder.remote_id = slot.remote_id.clone();
        placeholder.updated_at = Some(stamp(slot.updated_at));
        *slot = placeholder.clone();
        self.commit(next, 0);
        info!(runner_id = id, "Runner reset to placeholder");
        Ok(vec![RaceEvent::local(RacePayload::RunnerUpdated {
            runner: placeholder,
        })])
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` for a zero pace and
    /// `Error::RunnerNotFound` for an unknown id.
    pub fn set_runner_pace(&mut self, id: RunnerId, pace: u32) -> Result<Vec<RaceEvent>> {
        if pace == 0 {
            return Err(Error::invalid_record("pace must be positive"));
        }
        let mut runner = self
            .runner(id)
            .cloned()
            .ok_or(Error::RunnerNotFound { id })?;
        runner.pace = pace;
        self.upsert_runner(runner)
    }

    // ==========================================================================
    // Legs
    // ==========================================================================

    /// Replace a leg's authored fields by id. Projections are always re-derived.
    ///
    /// # Errors
    ///
    /// Returns `Error::LegNotFound`, `Error::RaceNotInitialized` or
    /// `Error::InvalidLegTime` when the finish is not after the start or the
    /// leg would run beside another running leg.
    pub fn upsert_leg(&mut self, mut leg: Leg) -> Result<Vec<RaceEvent>> {
        let index = self.leg_position(leg.id)?;
        check_times(leg.id, leg.actual_start, leg.actual_finish)?;
        let mut next = self.state.clone();
        let Some(slot) = next.legs.get_mut(index) else {
            return Err(Error::LegNotFound { id: leg.id });
        };
        if leg.remote_id.is_none() {
            leg.remote_id = slot.remote_id.clone();
        }
        leg.updated_at = Some(stamp(slot.updated_at));
        leg.projected_start = slot.projected_start;
        leg.projected_finish = slot.projected_finish;
        let leg_id = leg.id;
        *slot = leg;
        check_single_running(leg_id, &self.state.legs, &next.legs)?;
        Ok(self.commit_legs(next, index, Origin::Local))
    }

    /// Reset a leg to its materialized default; the race always keeps N legs.
    ///
    /// # Errors
    ///
    /// Returns `Error::LegNotFound` or `Error::RaceNotInitialized`.
    pub fn delete_leg(&mut self, id: LegId) -> Result<Vec<RaceEvent>> {
        let index = self.leg_position(id)?;
        let mut next = self.state.clone();
        let default = self
            .calculator
            .default_leg(index, &next.runners)
            .ok_or(Error::LegNotFound { id })?;
        let Some(slot) = next.legs.get_mut(index) else {
            return Err(Error::LegNotFound { id });
        };
        let mut reset = default;
        reset.remote_id = slot.remote_id.clone();
        reset.updated_at = Some(stamp(slot.updated_at));
        reset.projected_start = slot.projected_start;
        *slot = reset;
        info!(leg_id = id, "Leg reset to default");
        Ok(self.commit_legs(next, index, Origin::Local))
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` for a zero override.
    pub fn set_pace_override(&mut self, leg_id: LegId, pace: Option<u32>) -> Result<Vec<RaceEvent>> {
        if pace == Some(0) {
            return Err(Error::invalid_record("pace override must be positive"));
        }
        self.edit_leg(leg_id, |leg| {
            leg.pace_override = pace;
            Ok(())
        })
    }

    /// Apply `edit` to one leg, stamp it and re-project from there.
    fn edit_leg(
        &mut self,
        leg_id: LegId,
        edit: impl FnOnce(&mut Leg) -> Result<()>,
    ) -> Result<Vec<RaceEvent>> {
        let index = self.leg_position(leg_id)?;
        let mut next = self.state.clone();
        let Some(leg) = next.legs.get_mut(index) else {
            return Err(Error::LegNotFound { id: leg_id });
        };
        edit(leg)?;
        leg.updated_at = Some(stamp(leg.updated_at));
        check_single_running(leg_id, &self.state.legs, &next.legs)?;
        Ok(self.commit_legs(next, index, Origin::Local))
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidStartTime` for a non-positive time.
    pub fn set_race_start_time(&mut self, start_time: Timestamp) -> Result<Vec<RaceEvent>> {
        if start_time <= 0 {
            return Err(Error::InvalidStartTime { value: start_time });
        }
        let mut next = self.state.clone();
        next.start_time = Some(start_time);
        self.commit(next, 0);
        info!(start_time, "Race start time set");
        Ok(vec![RaceEvent::local(RacePayload::StartTimeChanged {
            start_time: Some(start_time),
        })])
    }

    // ==========================================================================
    // Time entry
    // ==========================================================================

    /// Record that a leg started at `at`. Any earlier leg still running is
    /// finished at the same instant.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLegTime` when the start is not before a recorded
    /// finish, would finish an earlier leg before its own start, or a later
    /// leg has already started.
    pub fn record_leg_start(&mut self, leg_id: LegId, at: Timestamp) -> Result<Vec<RaceEvent>> {
        let index = self.leg_position(leg_id)?;
        let mut next = self.state.clone();

        if next.legs.iter().skip(index.saturating_add(1)).any(Leg::is_started) {
            return Err(Error::invalid_leg_time(leg_id, "a later leg has already started"));
        }
        let mut first_changed = index;
        for (i, earlier) in next.legs.iter_mut().enumerate().take(index) {
            if !earlier.is_running() {
                continue;
            }
            check_times(earlier.id, earlier.actual_start, Some(at))?;
            earlier.actual_finish = Some(at);
            earlier.updated_at = Some(stamp(earlier.updated_at));
            first_changed = first_changed.min(i);
        }

        // Same projection a handoff would see before the start freezes it.
        self.calculator
            .recalculate_projections(&mut next.legs, first_changed, &next.runners, next.start_time);
        let Some(leg) = next.legs.get_mut(index) else {
            return Err(Error::LegNotFound { id: leg_id });
        };
        check_times(leg_id, Some(at), leg.actual_finish)?;
        leg.actual_start = Some(at);
        leg.updated_at = Some(stamp(leg.updated_at));
        info!(leg_id, at, "Leg started");
        Ok(self.commit_legs(next, first_changed, Origin::Local))
    }

    /// Record that a leg finished at `at` and hand off to the next leg.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLegTime` when the leg has not started or `at` is
    /// not after its start.
    pub fn record_leg_finish(&mut self, leg_id: LegId, at: Timestamp) -> Result<Vec<RaceEvent>> {
        let index = self.leg_position(leg_id)?;
        let mut next = self.state.clone();
        let Some(leg) = next.legs.get_mut(index) else {
            return Err(Error::LegNotFound { id: leg_id });
        };
        if leg.actual_start.is_none() {
            return Err(Error::invalid_leg_time(leg_id, "leg has not started"));
        }
        check_times(leg_id, leg.actual_start, Some(at))?;
        leg.actual_finish = Some(at);
        leg.updated_at = Some(stamp(leg.updated_at));

        // Re-project first so the next leg's projected start lands on the
        // finish before the handoff freezes it.
        self.calculator
            .recalculate_projections(&mut next.legs, index, &next.runners, next.start_time);
        let later_started = next.legs.iter().skip(index.saturating_add(1)).any(Leg::is_started);
        let handoff = if later_started {
            None
        } else {
            auto_start_next_leg(&mut next.legs, index)
        };
        if let Some(started) = handoff {
            if let Some(started_leg) = next.legs.iter_mut().find(|l| l.id == started) {
                started_leg.updated_at = Some(stamp(started_leg.updated_at));
            }
            debug!(leg_id = started, at, "Next leg auto-started");
        }
        info!(leg_id, at, "Leg finished");
        Ok(self.commit_legs(next, index, Origin::Local))
    }

    /// Manual correction of a leg's recorded times.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLegTime` for a finish without a start, a
    /// finish not after the start, or a start that leaves two legs running.
    pub fn edit_leg_times(
        &mut self,
        leg_id: LegId,
        start: Option<Timestamp>,
        finish: Option<Timestamp>,
    ) -> Result<Vec<RaceEvent>> {
        if start.is_none() && finish.is_some() {
            return Err(Error::invalid_leg_time(leg_id, "finish requires a start"));
        }
        check_times(leg_id, start, finish)?;
        self.edit_leg(leg_id, |leg| {
            leg.actual_start = start;
            leg.actual_finish = finish;
            Ok(())
        })
    }

    // ==========================================================================
    // Setup
    // ==========================================================================

    /// Materialize the legs from the current roster.
    ///
    /// # Errors
    ///
    /// Returns `Error::SetupLocked` once remote data exists, and
    /// `Error::InvalidStartTime` for a non-positive start.
    pub fn complete_setup(&mut self, start_time: Timestamp) -> Result<Vec<RaceEvent>> {
        if self.meta.setup_locked {
            return Err(Error::SetupLocked {
                team_id: self
                    .meta
                    .team_id
                    .as_ref()
                    .map_or_else(String::new, ToString::to_string),
            });
        }
        let mut legs = self
            .calculator
            .initialize_race_or_default(start_time, &self.state.runners)?;
        let now = Utc::now();
        for leg in &mut legs {
            leg.updated_at = Some(now);
        }

        let next = RaceState {
            start_time: Some(start_time),
            runners: self.state.runners.clone(),
            legs,
        };
        self.commit(next, 0);
        self.meta.setup_complete = true;
        info!(start_time, legs = self.state.legs.len(), "Setup complete");
        Ok(vec![
            RaceEvent::local(RacePayload::RaceDataReplaced),
            RaceEvent::local(RacePayload::StartTimeChanged {
                start_time: Some(start_time),
            }),
        ])
    }

    /// Give every listed leg to `runner_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::RunnerNotFound` for an unknown or invalid runner and
    /// `Error::LegNotFound` for an unknown leg. Nothing changes on error.
    pub fn assign_runner_to_legs(
        &mut self,
        runner_id: RunnerId,
        leg_ids: &[LegId],
    ) -> Result<Vec<RaceEvent>> {
        if !self.runner(runner_id).is_some_and(Runner::is_valid) {
            return Err(Error::RunnerNotFound { id: runner_id });
        }
        let positions = leg_ids
            .iter()
            .map(|id| self.leg_position(*id))
            .collect::<Result<Vec<usize>>>()?;

        let mut next = self.state.clone();
        for index in &positions {
            if let Some(leg) = next.legs.get_mut(*index) {
                leg.runner_id = runner_id;
                leg.updated_at = Some(stamp(leg.updated_at));
            }
        }
        let from = positions.iter().copied().min().unwrap_or(0);
        Ok(self.commit_legs(next, from, Origin::Local))
    }

    // ==========================================================================
    // Remote application
    // ==========================================================================

    /// Apply already-merged remote runners, keyed by local id.
    pub fn apply_remote_runners(&mut self, runners: Vec<Runner>) -> Vec<RaceEvent> {
        let mut next = self.state.clone();
        let mut events = Vec::new();
        for runner in runners {
            if !is_roster_id(runner.id) || !runner.is_valid() {
                warn!(runner_id = runner.id, remote_id = ?runner.remote_id, "Skipping invalid remote runner");
                continue;
            }
            let Some(slot) = next.runners.iter_mut().find(|r| r.id == runner.id) else {
                continue;
            };
            if *slot == runner {
                continue;
            }
            *slot = runner.clone();
            events.push(RaceEvent::remote(RacePayload::RunnerUpdated { runner }));
        }
        if !events.is_empty() {
            self.commit(next, 0);
            debug!(count = events.len(), "Applied remote runners");
        }
        events
    }

    /// Apply already-merged remote legs, keyed by leg number. An uninitialized
    /// race is materialized first. Impossible leg states are repaired before
    /// the commit; recorded times are never removed.
    pub fn apply_remote_legs(&mut self, legs: Vec<Leg>) -> Vec<RaceEvent> {
        let mut next = self.state.clone();
        if next.legs.is_empty() && !legs.is_empty() {
            next.legs = (0..self.calculator.leg_count())
                .filter_map(|index| self.calculator.default_leg(index, &next.runners))
                .collect();
        }

        let mut changed = false;
        for mut leg in legs {
            if check_times(leg.id, leg.actual_start, leg.actual_finish).is_err() {
                warn!(leg_id = leg.id, "Remote leg has finish before start, keeping it for repair");
            }
            let Some(slot) = next.legs.iter_mut().find(|l| l.id == leg.id) else {
                warn!(leg_id = leg.id, "Skipping remote leg outside the race");
                continue;
            };
            leg.projected_start = slot.projected_start;
            leg.projected_finish = slot.projected_finish;
            if *slot != leg {
                *slot = leg;
                changed = true;
            }
        }
        if !changed {
            return Vec::new();
        }

        let repair = detect_and_repair_impossible_leg_states(&next.legs);
        for change in &repair.changes {
            warn!(change = %change, "Repaired remote legs");
        }
        next.legs = repair.legs;

        let events = self.commit_legs(next, 0, Origin::Remote);
        debug!(count = events.len(), "Applied remote legs");
        events
    }

    // ==========================================================================
    // Consistency
    // ==========================================================================

    /// 12 valid runners with unique ids, and every leg points at one of them.
    pub fn is_data_consistent(&self) -> bool {
        let runners = &self.state.runners;
        let ids_ok = runners.len() == RUNNER_COUNT
            && (1..=RUNNER_COUNT)
                .filter_map(|slot| RunnerId::try_from(slot).ok())
                .all(|id| runners.iter().filter(|r| r.id == id).count() == 1);
        let runners_ok = runners.iter().all(Runner::is_valid);
        let legs_ok = (self.state.legs.is_empty()
            || self.state.legs.len() == self.calculator.leg_count())
            && self
                .state
                .legs
                .iter()
                .all(|leg| runners.iter().any(|r| r.id == leg.runner_id && r.is_valid()));
        ids_ok && runners_ok && legs_ok
    }

    /// Repair the roster, orphaned legs and impossible leg states.
    pub fn fix_data_inconsistencies(&mut self) -> FixReport {
        let mut next = self.state.clone();
        let (runners, mut changes) = normalize_roster(&next.runners);
        next.runners = runners;
        if next.runners != self.state.runners && changes.is_empty() {
            changes.push("Roster reordered".to_string());
        }

        changes.extend(reassign_orphaned_legs(&mut next.legs, &next.runners));
        let repair = detect_and_repair_impossible_leg_states(&next.legs);
        changes.extend(repair.changes);
        next.legs = repair.legs;

        if changes.is_empty() {
            return FixReport {
                unresolved: repair.unresolved,
                ..FixReport::default()
            };
        }
        for change in &changes {
            warn!(change = %change, "Fixed data inconsistency");
        }

        let runners_before = self.state.runners.clone();
        let mut events = self.commit_legs(next, 0, Origin::Local);
        events.extend(
            self.state
                .runners
                .iter()
                .filter(|r| !runners_before.contains(r))
                .map(|r| RaceEvent::local(RacePayload::RunnerUpdated { runner: r.clone() })),
        );
        FixReport {
            changed: true,
            changes,
            unresolved: repair.unresolved,
            events,
        }
    }

    /// Back to 12 default runners and no legs. Team identity is kept.
    pub fn force_reset(&mut self) -> Vec<RaceEvent> {
        warn!(generation = self.generation, "Forcing race state reset");
        self.commit(RaceState::default(), 0);
        self.meta.setup_complete = false;
        vec![RaceEvent::local(RacePayload::StateReset {
            reason: "forced reset".to_string(),
        })]
    }

    // ==========================================================================
    // Undo
    // ==========================================================================

    /// True while a leg is running or the final leg has finished.
    pub fn can_undo(&self) -> bool {
        self.state.legs.iter().any(Leg::is_running) || is_race_finished(&self.state.legs)
    }

    /// Undo the most recent start. A finished final leg is only "unfinished";
    /// otherwise the leg loses its times and the previous leg its finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::RaceNotInitialized` before setup.
    pub fn undo_last_start_runner(&mut self) -> Result<Vec<RaceEvent>> {
        if !self.state.is_initialized() {
            return Err(Error::RaceNotInitialized);
        }
        if !self.can_undo() {
            return Ok(Vec::new());
        }
        let Some(index) = self.state.legs.iter().rposition(Leg::is_started) else {
            return Ok(Vec::new());
        };
        let last = self.state.legs.len().saturating_sub(1);
        let mut next = self.state.clone();

        let from = if index == last && is_race_finished(&next.legs) {
            if let Some(leg) = next.legs.get_mut(index) {
                leg.actual_finish = None;
                leg.updated_at = Some(stamp(leg.updated_at));
                info!(leg_id = leg.id, "Undo: final leg unfinished");
            }
            index
        } else {
            if let Some(leg) = next.legs.get_mut(index) {
                leg.actual_start = None;
                leg.actual_finish = None;
                leg.updated_at = Some(stamp(leg.updated_at));
                info!(leg_id = leg.id, "Undo: leg start cleared");
            }
            match index.checked_sub(1).and_then(|prev| next.legs.get_mut(prev).map(|l| (prev, l))) {
                Some((prev, leg)) => {
                    leg.actual_finish = None;
                    leg.updated_at = Some(stamp(leg.updated_at));
                    prev
                }
                None => index,
            }
        };
        Ok(self.commit_legs(next, from, Origin::Local))
    }
}

fn running_count(legs: &[Leg]) -> usize {
    legs.iter().filter(|l| l.is_running()).count()
}

/// Reject a local edit that adds a running leg while another one runs.
fn check_single_running(leg_id: LegId, before: &[Leg], after: &[Leg]) -> Result<()> {
    let running = running_count(after);
    if running > 1 && running > running_count(before) {
        return Err(Error::invalid_leg_time(
            leg_id,
            format!("{running} legs would be running at once"),
        ));
    }
    Ok(())
}

fn check_times(leg_id: LegId, start: Option<Timestamp>, finish: Option<Timestamp>) -> Result<()> {
    match (start, finish) {
        (Some(start), Some(finish)) if finish <= start => Err(Error::invalid_leg_time(
            leg_id,
            format!("finish {finish} is not after start {start}"),
        )),
        _ => Ok(()),
    }
}
