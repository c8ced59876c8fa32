//! Relay schedule projection.
//!
//! Pure schedule math over [`baton_core::Leg`] lists:
//!
//! - **Calculator**: [`ProjectionCalculator`] builds and re-projects the leg list
//! - **Timeline**: current/next leg, major exchanges, the handoff rule
//! - **Validation**: [`validate_race_state`] reports invariant violations
//! - **Repair**: back-fills missing times so the race is consistent again

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod calculator;
pub mod repair;
pub mod timeline;
pub mod validation;

pub use calculator::{pace_duration_ms, ProjectionCalculator, RaceCursor, RaceCursorCache};
pub use repair::{
    auto_fix_single_runner_violations, detect_and_repair_impossible_leg_states, RepairOutcome,
};
pub use timeline::{
    auto_start_next_leg, current_leg, is_major_exchange, is_race_finished, major_exchanges,
    next_leg, race_finish_time,
};
pub use validation::{validate_race_state, ValidationIssue, ValidationReport};
