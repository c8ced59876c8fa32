//! Schedule projection.
//!
//! Turns a sparse set of recorded actual times into a complete schedule.
//! Projection is a pure function of the leg list, the roster and the race
//! start, so every device derives the same schedule from the same inputs.

use std::sync::{Mutex, PoisonError};

use baton_core::{
    default_runners, Error, Leg, LegId, RaceConfig, Result, Runner, Timestamp, DEFAULT_DISTANCES,
    DEFAULT_PACE_SECS, RUNNER_COUNT,
};
use tracing::{debug, warn};

use crate::timeline::{current_leg, next_leg};

/// Milliseconds needed to cover `distance` miles at `pace` seconds per mile.
#[allow(clippy::cast_possible_truncation)]
pub fn pace_duration_ms(pace: u32, distance: f64) -> i64 {
    (f64::from(pace) * distance * 1000.0).round() as i64
}

/// Running and next leg, as last computed for one store generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaceCursor {
    pub current: Option<LegId>,
    pub next: Option<LegId>,
}

/// Memoized [`RaceCursor`] keyed by the store generation.
#[derive(Debug, Default)]
pub struct RaceCursorCache {
    generation: Option<u64>,
    cursor: RaceCursor,
}

impl RaceCursorCache {
    /// Cached cursor for `generation`, if one was stored.
    pub fn get(&self, generation: u64) -> Option<RaceCursor> {
        (self.generation == Some(generation)).then_some(self.cursor)
    }

    pub fn store(&mut self, generation: u64, cursor: RaceCursor) {
        self.generation = Some(generation);
        self.cursor = cursor;
    }

    pub fn invalidate(&mut self) {
        self.generation = None;
        self.cursor = RaceCursor::default();
    }
}

/// Owns the distance table, the fallback pace and the cursor cache.
#[derive(Debug)]
pub struct ProjectionCalculator {
    distances: Vec<f64>,
    default_pace: u32,
    cursor: Mutex<RaceCursorCache>,
}

impl Default for ProjectionCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCES.to_vec(), DEFAULT_PACE_SECS)
    }
}

impl Clone for ProjectionCalculator {
    fn clone(&self) -> Self {
        Self::new(self.distances.clone(), self.default_pace)
    }
}

impl ProjectionCalculator {
    pub fn new(distances: Vec<f64>, default_pace: u32) -> Self {
        Self {
            distances,
            default_pace: if default_pace == 0 {
                DEFAULT_PACE_SECS
            } else {
                default_pace
            },
            cursor: Mutex::new(RaceCursorCache::default()),
        }
    }

    pub fn from_config(config: &RaceConfig) -> Self {
        Self::new(config.distances.clone(), config.default_pace_secs)
    }

    /// Number of legs in a materialized race.
    pub fn leg_count(&self) -> usize {
        self.distances.len()
    }

    pub fn distances(&self) -> &[f64] {
        &self.distances
    }

    pub const fn default_pace(&self) -> u32 {
        self.default_pace
    }

    /// Build the full ordered leg list, assigning valid runners round-robin.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStartTime` for a non-positive start and
    /// `Error::NoValidRunners` when every runner is rejected.
    pub fn initialize_race(&self, start_time: Timestamp, runners: &[Runner]) -> Result<Vec<Leg>> {
        if start_time <= 0 {
            return Err(Error::InvalidStartTime { value: start_time });
        }

        let (valid, rejected): (Vec<&Runner>, Vec<&Runner>) =
            runners.iter().partition(|r| r.is_valid());
        if !rejected.is_empty() {
            let rejected_ids: Vec<u32> = rejected.iter().map(|r| r.id).collect();
            warn!(rejected = ?rejected_ids, "Ignoring invalid runners while initializing race");
        }
        if valid.is_empty() {
            return Err(Error::NoValidRunners {
                rejected: rejected.len(),
            });
        }

        let mut legs: Vec<Leg> = self
            .distances
            .iter()
            .enumerate()
            .zip(valid.iter().cycle())
            .map(|((index, distance), runner)| Leg::new(leg_id_for(index), runner.id, *distance))
            .collect();
        self.recalculate_projections(&mut legs, 0, runners, Some(start_time));

        debug!(legs = legs.len(), runners = valid.len(), start_time, "Initialized race");
        Ok(legs)
    }

    /// [`Self::initialize_race`], falling back to the default roster when no
    /// supplied runner is usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStartTime` for a non-positive start.
    pub fn initialize_race_or_default(
        &self,
        start_time: Timestamp,
        runners: &[Runner],
    ) -> Result<Vec<Leg>> {
        match self.initialize_race(start_time, runners) {
            Err(Error::NoValidRunners { rejected }) => {
                warn!(rejected, "No valid runners, initializing with the default roster");
                self.initialize_race(start_time, &default_runners())
            }
            other => other,
        }
    }

    /// The leg at `index` as `initialize_race` would have built it, without times.
    pub fn default_leg(&self, index: usize, runners: &[Runner]) -> Option<Leg> {
        let distance = *self.distances.get(index)?;
        let valid: Vec<&Runner> = runners.iter().filter(|r| r.is_valid()).collect();
        let runner_id = match valid.get(index % valid.len().max(1)) {
            Some(runner) => runner.id,
            None => leg_id_for(index % RUNNER_COUNT),
        };
        Some(Leg::new(leg_id_for(index), runner_id, distance))
    }

    /// Seconds per mile for a leg: override, then runner pace, then fallback.
    pub fn effective_pace(&self, leg: &Leg, runners: &[Runner]) -> u32 {
        leg.pace_override
            .filter(|p| *p > 0)
            .or_else(|| {
                runners
                    .iter()
                    .find(|r| r.id == leg.runner_id)
                    .map(|r| r.pace)
                    .filter(|p| *p > 0)
            })
            .unwrap_or(self.default_pace)
    }

    /// Recompute projections for every leg at or after `from_index`.
    ///
    /// Started legs keep their projected start; their finish is re-derived
    /// from the recorded start.
    pub fn recalculate_projections(
        &self,
        legs: &mut [Leg],
        from_index: usize,
        runners: &[Runner],
        race_start: Option<Timestamp>,
    ) {
        for index in from_index..legs.len() {
            let previous_finish = index
                .checked_sub(1)
                .and_then(|prev| legs.get(prev))
                .map(Leg::effective_finish);
            let pace = match legs.get(index) {
                Some(leg) => self.effective_pace(leg, runners),
                None => break,
            };
            let Some(leg) = legs.get_mut(index) else {
                break;
            };
            let duration = pace_duration_ms(pace, leg.distance);

            match (previous_finish, leg.actual_start) {
                // First leg
                (None, actual_start) => {
                    let start = actual_start
                        .or(race_start)
                        .unwrap_or(leg.projected_start);
                    leg.projected_start = start;
                    leg.projected_finish = start.saturating_add(duration);
                }
                (Some(_), Some(actual_start)) => {
                    leg.projected_finish = actual_start.saturating_add(duration);
                }
                (Some(previous_finish), None) => {
                    leg.projected_start = previous_finish;
                    leg.projected_finish = previous_finish.saturating_add(duration);
                }
            }
        }
    }

    /// Recompute the whole schedule.
    pub fn recalculate_all(&self, legs: &mut [Leg], runners: &[Runner], race_start: Option<Timestamp>) {
        self.recalculate_projections(legs, 0, runners, race_start);
    }

    /// Current and next leg for a store generation, served from the cache when fresh.
    pub fn cursor(&self, generation: u64, legs: &[Leg]) -> RaceCursor {
        let mut cache = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cursor) = cache.get(generation) {
            return cursor;
        }
        let cursor = RaceCursor {
            current: current_leg(legs).map(|l| l.id),
            next: next_leg(legs).map(|l| l.id),
        };
        cache.store(generation, cursor);
        cursor
    }

    /// Drop the cached cursor; the next lookup recomputes it.
    pub fn invalidate_cursor(&self) {
        self.cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }
}

#[allow(clippy::cast_possible_truncation)]
fn leg_id_for(index: usize) -> LegId {
    (index as LegId).saturating_add(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use baton_core::Van;

    use super::*;

    const T: Timestamp = 1_700_000_000_000;

    fn two_runners() -> Vec<Runner> {
        vec![Runner::new(1, "Ana", 480, Van::One), Runner::new(2, "Ben", 540, Van::Two)]
    }

    #[test]
    fn should_compute_duration_in_rounded_milliseconds() {
        assert_eq!(pace_duration_ms(600, 5.8), 3_480_000);
        assert_eq!(pace_duration_ms(1, 0.0005), 1);
        assert_eq!(pace_duration_ms(0, 4.0), 0);
    }

    #[test]
    fn should_assign_valid_runners_round_robin() {
        let calc = ProjectionCalculator::new(vec![1.0, 2.0, 3.0], 600);
        let mut runners = two_runners();
        runners.push(Runner::new(3, "Broken", 0, Van::One));

        let legs = calc.initialize_race(T, &runners).unwrap();

        let assigned: Vec<u32> = legs.iter().map(|l| l.runner_id).collect();
        assert_eq!(assigned, vec![1, 2, 1]);
        assert_eq!(legs.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn should_chain_projections_from_race_start() {
        let calc = ProjectionCalculator::new(vec![1.0, 2.0], 600);
        let legs = calc.initialize_race(T, &two_runners()).unwrap();

        assert_eq!(legs[0].projected_start, T);
        assert_eq!(legs[0].projected_finish, T + 480_000);
        assert_eq!(legs[1].projected_start, T + 480_000);
        assert_eq!(legs[1].projected_finish, T + 480_000 + 1_080_000);
    }

    #[test]
    fn should_reject_non_positive_start_time() {
        let calc = ProjectionCalculator::default();
        let err = calc.initialize_race(0, &two_runners()).unwrap_err();
        assert!(matches!(err, Error::InvalidStartTime { value: 0 }));
    }

    #[test]
    fn should_reject_roster_without_valid_runners() {
        let calc = ProjectionCalculator::default();
        let runners = vec![Runner::new(1, "Zero", 0, Van::One)];

        let err = calc.initialize_race(T, &runners).unwrap_err();
        assert!(matches!(err, Error::NoValidRunners { rejected: 1 }));
    }

    #[test]
    fn should_fall_back_to_default_roster() {
        let calc = ProjectionCalculator::default();
        let legs = calc.initialize_race_or_default(T, &[]).unwrap();

        assert_eq!(legs.len(), DEFAULT_DISTANCES.len());
        assert_eq!(legs[12].runner_id, 1);
        assert_eq!(legs[0].projected_finish, T + pace_duration_ms(600, 5.8));
    }

    #[test]
    fn should_freeze_projected_start_of_started_leg() {
        let calc = ProjectionCalculator::new(vec![1.0, 1.0], 600);
        let runners = two_runners();
        let mut legs = calc.initialize_race(T, &runners).unwrap();
        let frozen = legs[1].projected_start;

        legs[1].actual_start = Some(frozen + 5_000);
        legs[0].actual_finish = Some(frozen + 5_000);
        calc.recalculate_projections(&mut legs, 1, &runners, Some(T));

        assert_eq!(legs[1].projected_start, frozen);
        assert_eq!(legs[1].projected_finish, frozen + 5_000 + 540_000);
    }

    #[test]
    fn should_prefer_pace_override_and_fall_back_for_missing_runner() {
        let calc = ProjectionCalculator::new(vec![1.0], 700);
        let mut leg = Leg::new(1, 99, 1.0);

        assert_eq!(calc.effective_pace(&leg, &two_runners()), 700);
        leg.pace_override = Some(300);
        assert_eq!(calc.effective_pace(&leg, &two_runners()), 300);
    }

    #[test]
    fn should_serve_cursor_from_cache_until_generation_changes() {
        let calc = ProjectionCalculator::new(vec![1.0, 1.0], 600);
        let mut legs = calc.initialize_race(T, &two_runners()).unwrap();
        legs[0].actual_start = Some(T);

        let first = calc.cursor(1, &legs);
        assert_eq!(first.current, Some(1));
        assert_eq!(first.next, Some(2));

        legs[0].actual_finish = Some(T + 1);
        legs[1].actual_start = Some(T + 1);
        assert_eq!(calc.cursor(1, &legs), first);
        assert_eq!(calc.cursor(2, &legs).current, Some(2));
    }
}
