//! Consistency checks over recorded leg times.

use std::fmt;

use baton_core::{Leg, LegId, Timestamp};
use serde::Serialize;

/// One detected inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Leg ids are not the contiguous sequence 1..=N.
    SequenceGap { expected: LegId, found: LegId },
    FinishBeforeStart {
        leg_id: LegId,
        start: Timestamp,
        finish: Timestamp,
    },
    /// A finish was recorded without a start.
    FinishWithoutStart { leg_id: LegId },
    /// Leg started before the previous leg's recorded finish.
    StartBeforePreviousFinish {
        leg_id: LegId,
        start: Timestamp,
        previous_finish: Timestamp,
    },
    /// Leg started while the previous leg has no recorded finish.
    PreviousLegUnfinished { leg_id: LegId, previous_leg_id: LegId },
    MultipleRunning { leg_ids: Vec<LegId> },
    /// Final leg finished while earlier legs are not.
    IncompleteRaceFinished { unfinished: Vec<LegId> },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceGap { expected, found } => {
                write!(f, "expected leg {expected}, found leg {found}")
            }
            Self::FinishBeforeStart {
                leg_id,
                start,
                finish,
            } => write!(f, "leg {leg_id} finishes at {finish}, not after its start {start}"),
            Self::FinishWithoutStart { leg_id } => {
                write!(f, "leg {leg_id} has a finish but no start")
            }
            Self::StartBeforePreviousFinish {
                leg_id,
                start,
                previous_finish,
            } => write!(
                f,
                "leg {leg_id} starts at {start}, before the previous leg finished at {previous_finish}"
            ),
            Self::PreviousLegUnfinished {
                leg_id,
                previous_leg_id,
            } => write!(f, "leg {leg_id} started but leg {previous_leg_id} never finished"),
            Self::MultipleRunning { leg_ids } => {
                write!(f, "{} legs running at once: {leg_ids:?}", leg_ids.len())
            }
            Self::IncompleteRaceFinished { unfinished } => {
                write!(f, "final leg finished while legs {unfinished:?} are unfinished")
            }
        }
    }
}

/// Result of [`validate_race_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}

/// Check recorded times against the race invariants. Never mutates.
pub fn validate_race_state(legs: &[Leg]) -> ValidationReport {
    let mut issues = Vec::new();

    let mut expected: LegId = 1;
    for leg in legs {
        if leg.id != expected {
            issues.push(ValidationIssue::SequenceGap {
                expected,
                found: leg.id,
            });
        }
        expected = leg.id.saturating_add(1);
    }

    for leg in legs {
        match (leg.actual_start, leg.actual_finish) {
            (Some(start), Some(finish)) if finish <= start => {
                issues.push(ValidationIssue::FinishBeforeStart {
                    leg_id: leg.id,
                    start,
                    finish,
                });
            }
            (None, Some(_)) => issues.push(ValidationIssue::FinishWithoutStart { leg_id: leg.id }),
            _ => {}
        }
    }

    for pair in legs.windows(2) {
        let [previous, leg] = pair else { continue };
        let Some(start) = leg.actual_start else {
            continue;
        };
        match previous.actual_finish {
            Some(previous_finish) if start < previous_finish => {
                issues.push(ValidationIssue::StartBeforePreviousFinish {
                    leg_id: leg.id,
                    start,
                    previous_finish,
                });
            }
            Some(_) => {}
            None => issues.push(ValidationIssue::PreviousLegUnfinished {
                leg_id: leg.id,
                previous_leg_id: previous.id,
            }),
        }
    }

    let running: Vec<LegId> = legs.iter().filter(|l| l.is_running()).map(|l| l.id).collect();
    if running.len() > 1 {
        issues.push(ValidationIssue::MultipleRunning { leg_ids: running });
    }

    if let Some((last, earlier)) = legs.split_last() {
        if last.is_finished() {
            let unfinished: Vec<LegId> = earlier
                .iter()
                .filter(|l| !l.is_finished())
                .map(|l| l.id)
                .collect();
            if !unfinished.is_empty() {
                issues.push(ValidationIssue::IncompleteRaceFinished { unfinished });
            }
        }
    }

    ValidationReport::from_issues(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legs(count: u32) -> Vec<Leg> {
        (1..=count).map(|id| Leg::new(id, 1, 1.0)).collect()
    }

    #[test]
    fn should_accept_clean_sequential_race() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(0);
        legs[0].actual_finish = Some(10);
        legs[1].actual_start = Some(10);

        let report = validate_race_state(&legs);
        assert!(report.is_valid, "{:?}", report.issues);
    }

    #[test]
    fn should_report_sequence_gap() {
        let mut legs = legs(3);
        legs[2].id = 5;

        let report = validate_race_state(&legs);
        assert_eq!(
            report.issues,
            vec![ValidationIssue::SequenceGap {
                expected: 3,
                found: 5
            }]
        );
    }

    #[test]
    fn should_report_finish_not_after_start() {
        let mut legs = legs(1);
        legs[0].actual_start = Some(50);
        legs[0].actual_finish = Some(50);

        let report = validate_race_state(&legs);
        assert!(!report.is_valid);
        assert!(matches!(
            report.issues[0],
            ValidationIssue::FinishBeforeStart { leg_id: 1, .. }
        ));
    }

    #[test]
    fn should_report_overlap_and_multiple_running_legs() {
        let mut legs = legs(3);
        legs[0].actual_start = Some(0);
        legs[1].actual_start = Some(10);

        let report = validate_race_state(&legs);
        assert!(report.issues.contains(&ValidationIssue::PreviousLegUnfinished {
            leg_id: 2,
            previous_leg_id: 1
        }));
        assert!(report
            .issues
            .contains(&ValidationIssue::MultipleRunning { leg_ids: vec![1, 2] }));
    }

    #[test]
    fn should_report_start_before_previous_finish() {
        let mut legs = legs(2);
        legs[0].actual_start = Some(0);
        legs[0].actual_finish = Some(100);
        legs[1].actual_start = Some(90);

        let report = validate_race_state(&legs);
        assert_eq!(
            report.issues,
            vec![ValidationIssue::StartBeforePreviousFinish {
                leg_id: 2,
                start: 90,
                previous_finish: 100
            }]
        );
    }

    #[test]
    fn should_report_final_leg_finished_early() {
        let mut legs = legs(3);
        legs[2].actual_start = Some(5);
        legs[2].actual_finish = Some(10);

        let report = validate_race_state(&legs);
        assert!(report
            .issues
            .contains(&ValidationIssue::IncompleteRaceFinished { unfinished: vec![1, 2] }));
        assert!(report.issues[0].to_string().contains("leg 3"));
    }
}
