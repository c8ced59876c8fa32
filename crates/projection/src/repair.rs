//! Repair of impossible leg states.
//!
//! Repairs only fill in missing times from neighbouring recorded times; no
//! recorded time is ever removed.

use baton_core::{Leg, Timestamp};
use tracing::warn;

/// Repaired legs plus a human-readable log of each change. Violations no
/// repair can resolve without inventing times are listed in `unresolved`;
/// they never count as changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairOutcome {
    pub legs: Vec<Leg>,
    pub changes: Vec<String>,
    pub unresolved: Vec<String>,
}

impl RepairOutcome {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Start of the first started leg after `index`.
fn next_recorded_start(legs: &[Leg], index: usize) -> Option<(usize, Timestamp)> {
    legs.iter()
        .enumerate()
        .skip(index.saturating_add(1))
        .find_map(|(i, leg)| leg.actual_start.map(|start| (i, start)))
}

/// Close every running leg that is followed by a started leg, so at most the
/// last one keeps running. The closed leg finishes when the next started leg began.
pub fn auto_fix_single_runner_violations(legs: &[Leg]) -> RepairOutcome {
    let mut repaired = legs.to_vec();
    let mut changes = Vec::new();
    let mut unresolved = Vec::new();

    for index in 0..repaired.len() {
        let Some(leg) = repaired.get(index) else {
            break;
        };
        let (leg_id, Some(start)) = (leg.id, leg.actual_start) else {
            continue;
        };
        if leg.actual_finish.is_some() {
            continue;
        }
        let Some((next_index, next_start)) = next_recorded_start(&repaired, index) else {
            continue;
        };
        let next_id = repaired.get(next_index).map_or(0, |l| l.id);

        if next_start <= start {
            warn!(leg_id, next_leg_id = next_id, "Cannot back-fill finish, next start is not later");
            unresolved.push(format!(
                "Leg {leg_id}: left running, leg {next_id} starts at {next_start} which is not after {start}"
            ));
            continue;
        }
        if let Some(leg) = repaired.get_mut(index) {
            leg.actual_finish = Some(next_start);
        }
        changes.push(format!(
            "Leg {leg_id}: set finish to {next_start} from the start of leg {next_id}"
        ));
    }

    for change in &changes {
        warn!(change = %change, "Repaired running leg");
    }
    RepairOutcome {
        legs: repaired,
        changes,
        unresolved,
    }
}

/// Repair every impossible state the validator can fix without guessing:
/// legs finished without a start get the previous leg's finish as their
/// start, then extra running legs are closed.
pub fn detect_and_repair_impossible_leg_states(legs: &[Leg]) -> RepairOutcome {
    let mut repaired = legs.to_vec();
    let mut changes = Vec::new();

    for index in 1..repaired.len() {
        let previous_finish = repaired
            .get(index.saturating_sub(1))
            .and_then(|l| l.actual_finish);
        let Some(leg) = repaired.get_mut(index) else {
            break;
        };
        let (None, Some(finish), Some(previous_finish)) =
            (leg.actual_start, leg.actual_finish, previous_finish)
        else {
            continue;
        };
        if previous_finish >= finish {
            continue;
        }
        leg.actual_start = Some(previous_finish);
        changes.push(format!(
            "Leg {}: set start to {previous_finish} from the finish of leg {}",
            leg.id,
            leg.id.saturating_sub(1)
        ));
    }
    for change in &changes {
        warn!(change = %change, "Repaired unstarted leg");
    }

    let single_runner = auto_fix_single_runner_violations(&repaired);
    changes.extend(single_runner.changes);
    RepairOutcome {
        legs: single_runner.legs,
        changes,
        unresolved: single_runner.unresolved,
    }
}

#[cfg(test)]
mod tests {
    use crate::validation::validate_race_state;

    use super::*;

    fn legs(count: u32) -> Vec<Leg> {
        (1..=count).map(|id| Leg::new(id, 1, 1.0)).collect()
    }

    #[test]
    fn should_keep_only_last_leg_running() {
        let mut legs = legs(4);
        legs[0].actual_start = Some(0);
        legs[1].actual_start = Some(100);
        legs[2].actual_start = Some(250);

        let outcome = auto_fix_single_runner_violations(&legs);

        assert_eq!(outcome.legs[0].actual_finish, Some(100));
        assert_eq!(outcome.legs[1].actual_finish, Some(250));
        assert_eq!(outcome.legs[2].actual_finish, None);
        assert_eq!(outcome.changes.len(), 2);
        assert!(validate_race_state(&outcome.legs).is_valid);
    }

    #[test]
    fn should_leave_clean_legs_untouched() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(0);
        legs[0].actual_finish = Some(10);
        legs[1].actual_start = Some(10);

        let outcome = detect_and_repair_impossible_leg_states(&legs);

        assert!(!outcome.changed());
        assert_eq!(outcome.legs, legs);
    }

    #[test]
    fn should_back_fill_start_of_leg_finished_without_start() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(0);
        legs[0].actual_finish = Some(10);
        legs[1].actual_finish = Some(30);

        let outcome = detect_and_repair_impossible_leg_states(&legs);

        assert_eq!(outcome.legs[1].actual_start, Some(10));
        assert!(outcome.changes[0].contains("Leg 2"));
    }

    #[test]
    fn should_not_create_finish_before_start() {
        let mut legs = legs(2);
        legs[0].actual_start = Some(100);
        legs[1].actual_start = Some(50);

        let outcome = auto_fix_single_runner_violations(&legs);

        assert_eq!(outcome.legs[0].actual_finish, None);
        assert!(!outcome.changed());
        assert!(outcome.unresolved[0].contains("left running"));
    }

    #[test]
    fn should_report_out_of_order_starts_as_unresolved_every_pass() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(5_000);
        legs[1].actual_start = Some(1_000);

        let first = detect_and_repair_impossible_leg_states(&legs);
        let second = detect_and_repair_impossible_leg_states(&first.legs);

        assert!(!first.changed());
        assert_eq!(first.legs, legs);
        assert_eq!(first.unresolved.len(), 1);
        assert_eq!(second, first);
    }
}
