//! Race progress events derived by diffing leg lists.

use baton_core::{Leg, Timestamp};
use baton_events::{Origin, RaceEvent, RacePayload};

/// Started, finished, handoff and race-finished events implied by going from
/// `before` to `after`. Legs are matched by id.
pub fn transition_events(before: &[Leg], after: &[Leg], origin: Origin) -> Vec<RaceEvent> {
    let mut events = Vec::new();

    for (index, leg) in after.iter().enumerate() {
        let previous = index.checked_sub(1).and_then(|prev| after.get(prev));

        if let Some(at) = newly_set(before, leg, |l| l.actual_start) {
            let handoff_from = previous.filter(|prev| {
                prev.actual_finish == Some(at)
                    && newly_set(before, prev, |l| l.actual_finish).is_some()
            });
            if let Some(prev) = handoff_from {
                events.push(RaceEvent::with_origin(
                    RacePayload::Handoff {
                        from_leg: prev.id,
                        to_leg: leg.id,
                        at,
                    },
                    origin,
                ));
            }
            events.push(RaceEvent::with_origin(
                RacePayload::LegStarted {
                    leg_id: leg.id,
                    runner_id: leg.runner_id,
                    at,
                },
                origin,
            ));
        }

        if let Some(at) = newly_set(before, leg, |l| l.actual_finish) {
            events.push(RaceEvent::with_origin(
                RacePayload::LegFinished {
                    leg_id: leg.id,
                    runner_id: leg.runner_id,
                    at,
                },
                origin,
            ));
            if index.saturating_add(1) == after.len() {
                events.push(RaceEvent::with_origin(RacePayload::RaceFinished { at }, origin));
            }
        }
    }
    events
}

/// The value of `field` on `leg` when it differs from the same leg in `before`.
fn newly_set(before: &[Leg], leg: &Leg, field: fn(&Leg) -> Option<Timestamp>) -> Option<Timestamp> {
    let now = field(leg)?;
    let was = before.iter().find(|l| l.id == leg.id).and_then(field);
    (was != Some(now)).then_some(now)
}

/// `LegUpdated` for every leg whose authored fields differ between the lists.
pub fn leg_update_events(before: &[Leg], after: &[Leg], origin: Origin) -> Vec<RaceEvent> {
    after
        .iter()
        .filter(|leg| {
            before
                .iter()
                .find(|l| l.id == leg.id)
                .is_none_or(|old| authored_fields_differ(old, leg))
        })
        .map(|leg| RaceEvent::with_origin(RacePayload::LegUpdated { leg: leg.clone() }, origin))
        .collect()
}

fn authored_fields_differ(a: &Leg, b: &Leg) -> bool {
    a.runner_id != b.runner_id
        || a.actual_start != b.actual_start
        || a.actual_finish != b.actual_finish
        || a.pace_override != b.pace_override
        || a.remote_id != b.remote_id
        || a.updated_at != b.updated_at
        || (a.distance - b.distance).abs() > f64::EPSILON
}

#[cfg(test)]
mod tests {
    use baton_events::EventKind;

    use super::*;

    fn legs(count: u32) -> Vec<Leg> {
        (1..=count).map(|id| Leg::new(id, id, 1.0)).collect()
    }

    fn kinds(events: &[RaceEvent]) -> Vec<EventKind> {
        events.iter().map(RaceEvent::kind).collect()
    }

    #[test]
    fn should_emit_finish_handoff_and_start_in_order() {
        let mut before = legs(3);
        before[0].actual_start = Some(0);
        let mut after = before.clone();
        after[0].actual_finish = Some(100);
        after[1].actual_start = Some(100);

        let events = transition_events(&before, &after, Origin::Local);

        assert_eq!(
            kinds(&events),
            vec![EventKind::LegFinished, EventKind::Handoff, EventKind::LegStarted]
        );
    }

    #[test]
    fn should_emit_race_finished_for_final_leg() {
        let mut before = legs(2);
        before[1].actual_start = Some(5);
        let mut after = before.clone();
        after[1].actual_finish = Some(9);

        let events = transition_events(&before, &after, Origin::Remote);

        assert_eq!(kinds(&events), vec![EventKind::LegFinished, EventKind::RaceFinished]);
        assert!(events.iter().all(|e| e.origin == Origin::Remote));
    }

    #[test]
    fn should_emit_nothing_for_unchanged_times() {
        let mut legs = legs(2);
        legs[0].actual_start = Some(1);
        assert!(transition_events(&legs, &legs, Origin::Local).is_empty());
        assert!(leg_update_events(&legs, &legs, Origin::Local).is_empty());
    }

    #[test]
    fn should_report_only_changed_legs() {
        let before = legs(3);
        let mut after = before.clone();
        after[2].pace_override = Some(400);

        let events = leg_update_events(&before, &after, Origin::Local);

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].payload, RacePayload::LegUpdated { leg } if leg.id == 3));
    }
}
