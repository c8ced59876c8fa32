//! Queries over an ordered leg list, and the handoff rule.

use baton_core::{default_van_for, Leg, LegId, Runner, Timestamp, Van};

/// The running leg. With more than one running, the furthest along wins.
pub fn current_leg(legs: &[Leg]) -> Option<&Leg> {
    legs.iter().rev().find(|l| l.is_running())
}

/// The leg that starts next: first unstarted leg after the current one.
pub fn next_leg(legs: &[Leg]) -> Option<&Leg> {
    let after = legs
        .iter()
        .rposition(Leg::is_running)
        .map_or(0, |index| index.saturating_add(1));
    legs.iter().skip(after).find(|l| !l.is_started())
}

/// Van a leg's runner rides in, falling back to the placeholder van.
fn van_of(leg: &Leg, runners: &[Runner]) -> Van {
    runners
        .iter()
        .find(|r| r.id == leg.runner_id)
        .map_or_else(|| default_van_for(leg.runner_id), |r| r.van)
}

/// A major exchange is a leg whose runner rides a different van than the
/// previous leg's runner.
pub fn is_major_exchange(legs: &[Leg], runners: &[Runner], leg_id: LegId) -> bool {
    let Some(index) = legs.iter().position(|l| l.id == leg_id) else {
        return false;
    };
    let Some(previous) = index.checked_sub(1).and_then(|prev| legs.get(prev)) else {
        return false;
    };
    legs.get(index)
        .is_some_and(|leg| van_of(leg, runners) != van_of(previous, runners))
}

/// Legs that begin a major exchange, in order.
pub fn major_exchanges(legs: &[Leg], runners: &[Runner]) -> Vec<LegId> {
    legs.iter()
        .filter(|leg| is_major_exchange(legs, runners, leg.id))
        .map(|leg| leg.id)
        .collect()
}

/// Actual finish of the final leg when recorded, its projection otherwise.
pub fn race_finish_time(legs: &[Leg]) -> Option<Timestamp> {
    legs.last().map(Leg::effective_finish)
}

/// Whether the final leg has been finished.
pub fn is_race_finished(legs: &[Leg]) -> bool {
    legs.last().is_some_and(Leg::is_finished)
}

/// Handoff: once leg `finished_index` has an actual finish, the next leg
/// starts at that instant unless it already has a start.
///
/// Returns the id of the leg that was started.
pub fn auto_start_next_leg(legs: &mut [Leg], finished_index: usize) -> Option<LegId> {
    let finished_at = legs.get(finished_index)?.actual_finish?;
    let next = legs.get_mut(finished_index.checked_add(1)?)?;
    if next.actual_start.is_some() {
        return None;
    }
    next.actual_start = Some(finished_at);
    Some(next.id)
}

#[cfg(test)]
mod tests {
    use baton_core::default_runners;

    use super::*;

    fn legs(count: u32) -> Vec<Leg> {
        (1..=count)
            .map(|id| Leg::new(id, ((id - 1) % 12) + 1, 1.0))
            .collect()
    }

    #[test]
    fn should_find_running_and_next_leg() {
        let mut legs = legs(4);
        assert!(current_leg(&legs).is_none());
        assert_eq!(next_leg(&legs).map(|l| l.id), Some(1));

        legs[0].actual_start = Some(10);
        legs[0].actual_finish = Some(20);
        legs[1].actual_start = Some(20);

        assert_eq!(current_leg(&legs).map(|l| l.id), Some(2));
        assert_eq!(next_leg(&legs).map(|l| l.id), Some(3));
    }

    #[test]
    fn should_report_no_next_leg_after_final_leg_starts() {
        let mut legs = legs(2);
        legs[0].actual_start = Some(1);
        legs[0].actual_finish = Some(2);
        legs[1].actual_start = Some(2);

        assert!(next_leg(&legs).is_none());
        assert!(!is_race_finished(&legs));
        legs[1].actual_finish = Some(3);
        assert!(is_race_finished(&legs));
        assert_eq!(race_finish_time(&legs), Some(3));
    }

    #[test]
    fn should_place_major_exchanges_at_van_changes() {
        let legs = legs(36);
        assert_eq!(major_exchanges(&legs, &default_runners()), vec![7, 13, 19, 25, 31]);
        assert!(!is_major_exchange(&legs, &default_runners(), 1));
        assert!(!is_major_exchange(&legs, &default_runners(), 99));
    }

    #[test]
    fn should_start_next_leg_at_previous_finish() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(100);
        legs[0].actual_finish = Some(200);

        assert_eq!(auto_start_next_leg(&mut legs, 0), Some(2));
        assert_eq!(legs[1].actual_start, Some(200));
    }

    #[test]
    fn should_not_overwrite_an_existing_start() {
        let mut legs = legs(3);
        legs[0].actual_finish = Some(200);
        legs[1].actual_start = Some(150);

        assert_eq!(auto_start_next_leg(&mut legs, 0), None);
        assert_eq!(legs[1].actual_start, Some(150));
        assert_eq!(auto_start_next_leg(&mut legs, 2), None);
    }
}
