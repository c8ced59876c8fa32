//! Race event types.

use baton_core::{Leg, LegId, Runner, RunnerId, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery class on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// State sync; always delivered before any low-priority event.
    High,
    /// Notification generation.
    Low,
}

/// Where the change behind an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Edited on this device.
    Local,
    /// Merged from the remote store.
    Remote,
}

/// Discriminant of [`RacePayload`], used for subscription patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RunnerUpdated,
    LegUpdated,
    RaceDataReplaced,
    StartTimeChanged,
    StateReset,
    LegStarted,
    LegFinished,
    Handoff,
    RaceFinished,
}

impl EventKind {
    pub const fn priority(self) -> Priority {
        match self {
            Self::RunnerUpdated
            | Self::LegUpdated
            | Self::RaceDataReplaced
            | Self::StartTimeChanged
            | Self::StateReset => Priority::High,
            Self::LegStarted | Self::LegFinished | Self::Handoff | Self::RaceFinished => {
                Priority::Low
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunnerUpdated => "runner_updated",
            Self::LegUpdated => "leg_updated",
            Self::RaceDataReplaced => "race_data_replaced",
            Self::StartTimeChanged => "start_time_changed",
            Self::StateReset => "state_reset",
            Self::LegStarted => "leg_started",
            Self::LegFinished => "leg_finished",
            Self::Handoff => "handoff",
            Self::RaceFinished => "race_finished",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RacePayload {
    /// A runner record changed (including replacement by a placeholder).
    RunnerUpdated { runner: Runner },
    /// A leg's authored fields changed (actual times, pace override, runner).
    LegUpdated { leg: Leg },
    /// The whole roster and leg list were replaced.
    RaceDataReplaced,
    StartTimeChanged { start_time: Option<Timestamp> },
    /// The store was reset to defaults.
    StateReset { reason: String },
    LegStarted {
        leg_id: LegId,
        runner_id: RunnerId,
        at: Timestamp,
    },
    LegFinished {
        leg_id: LegId,
        runner_id: RunnerId,
        at: Timestamp,
    },
    /// One leg's finish started the next.
    Handoff {
        from_leg: LegId,
        to_leg: LegId,
        at: Timestamp,
    },
    RaceFinished { at: Timestamp },
}

impl RacePayload {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::RunnerUpdated { .. } => EventKind::RunnerUpdated,
            Self::LegUpdated { .. } => EventKind::LegUpdated,
            Self::RaceDataReplaced => EventKind::RaceDataReplaced,
            Self::StartTimeChanged { .. } => EventKind::StartTimeChanged,
            Self::StateReset { .. } => EventKind::StateReset,
            Self::LegStarted { .. } => EventKind::LegStarted,
            Self::LegFinished { .. } => EventKind::LegFinished,
            Self::Handoff { .. } => EventKind::Handoff,
            Self::RaceFinished { .. } => EventKind::RaceFinished,
        }
    }
}

/// A race event as carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceEvent {
    pub event_id: EventId,
    pub origin: Origin,
    pub payload: RacePayload,
    pub timestamp: DateTime<Utc>,
}

impl RaceEvent {
    /// Wrap a payload produced on this device.
    pub fn local(payload: RacePayload) -> Self {
        Self::with_origin(payload, Origin::Local)
    }

    /// Wrap a payload produced by a remote merge.
    pub fn remote(payload: RacePayload) -> Self {
        Self::with_origin(payload, Origin::Remote)
    }

    pub fn with_origin(payload: RacePayload, origin: Origin) -> Self {
        Self {
            event_id: EventId::new(),
            origin,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub const fn priority(&self) -> Priority {
        self.payload.kind().priority()
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_route_sync_payloads_to_high_priority() {
        let event = RaceEvent::local(RacePayload::RunnerUpdated {
            runner: Runner::placeholder(1),
        });
        assert_eq!(event.priority(), Priority::High);
        assert!(event.is_local());
    }

    #[test]
    fn should_route_notification_payloads_to_low_priority() {
        let event = RaceEvent::remote(RacePayload::Handoff {
            from_leg: 3,
            to_leg: 4,
            at: 100,
        });
        assert_eq!(event.priority(), Priority::Low);
        assert_eq!(event.kind().as_str(), "handoff");
        assert!(!event.is_local());
    }
}
