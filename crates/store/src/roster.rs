//! Roster normalization.
//!
//! A team always has exactly [`RUNNER_COUNT`] runners with ids `1..=12`.
//! Anything missing or invalid is replaced by a placeholder.

use baton_core::{Leg, Runner, RunnerId, RUNNER_COUNT};
use tracing::warn;

/// Whether `id` is a legal local runner id.
pub fn is_roster_id(id: RunnerId) -> bool {
    (1..=RUNNER_COUNT).contains(&(id as usize))
}

/// Produce a full roster from `runners`, keeping the first valid runner for
/// each id and filling every other slot with a placeholder.
///
/// Returns the roster and one log line per replaced slot.
pub fn normalize_roster(runners: &[Runner]) -> (Vec<Runner>, Vec<String>) {
    let mut changes = Vec::new();
    let rejected: Vec<RunnerId> = runners
        .iter()
        .filter(|r| !r.is_valid() || !is_roster_id(r.id))
        .map(|r| r.id)
        .collect();
    if !rejected.is_empty() {
        warn!(rejected = ?rejected, "Rejected invalid runners");
    }

    let roster = (1..=RUNNER_COUNT)
        .filter_map(|slot| RunnerId::try_from(slot).ok())
        .map(|id| {
            runners
                .iter()
                .find(|r| r.id == id && r.is_valid())
                .cloned()
                .unwrap_or_else(|| {
                    let existing = runners.iter().find(|r| r.id == id);
                    let mut placeholder = Runner::placeholder(id);
                    placeholder.remote_id = existing.and_then(|r| r.remote_id.clone());
                    changes.push(format!("Runner {id}: replaced with placeholder"));
                    placeholder
                })
        })
        .collect();
    (roster, changes)
}

/// Point every leg whose runner does not exist at a valid runner, round-robin
/// by leg position. Returns one log line per reassigned leg.
pub fn reassign_orphaned_legs(legs: &mut [Leg], runners: &[Runner]) -> Vec<String> {
    let valid: Vec<RunnerId> = runners.iter().filter(|r| r.is_valid()).map(|r| r.id).collect();
    if valid.is_empty() {
        return Vec::new();
    }

    let mut changes = Vec::new();
    for (index, leg) in legs.iter_mut().enumerate() {
        if valid.contains(&leg.runner_id) {
            continue;
        }
        let Some(&replacement) = valid.get(index % valid.len()) else {
            continue;
        };
        changes.push(format!(
            "Leg {}: reassigned from missing runner {} to runner {replacement}",
            leg.id, leg.runner_id
        ));
        leg.runner_id = replacement;
    }
    changes
}

#[cfg(test)]
mod tests {
    use baton_core::Van;

    use super::*;

    #[test]
    fn should_fill_missing_and_invalid_slots_with_placeholders() {
        let runners = vec![
            Runner::new(2, "Ana", 480, Van::One),
            Runner::new(3, "Broken", 0, Van::One),
            Runner::new(40, "Stray", 500, Van::Two),
        ];

        let (roster, changes) = normalize_roster(&runners);

        assert_eq!(roster.len(), RUNNER_COUNT);
        assert_eq!(roster[1].name, "Ana");
        assert_eq!(roster[2], Runner::placeholder(3));
        assert_eq!(changes.len(), RUNNER_COUNT - 1);
    }

    #[test]
    fn should_reassign_legs_of_missing_runners() {
        let runners = vec![Runner::new(1, "Ana", 480, Van::One), Runner::new(2, "Ben", 480, Van::One)];
        let mut legs = vec![Leg::new(1, 1, 1.0), Leg::new(2, 9, 1.0), Leg::new(3, 9, 1.0)];

        let changes = reassign_orphaned_legs(&mut legs, &runners);

        assert_eq!(legs.iter().map(|l| l.runner_id).collect::<Vec<_>>(), vec![1, 2, 1]);
        assert_eq!(changes.len(), 2);
    }
}
