//! Race domain types shared by every Baton crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Local sequence id of a runner (1..=12).
pub type RunnerId = u32;

/// Sequence number of a leg (1..=N).
pub type LegId = u32;

/// Number of runners on a team.
pub const RUNNER_COUNT: usize = 12;

/// Pace given to placeholder runners, in seconds per mile.
pub const DEFAULT_PACE_SECS: u32 = 600;

/// Default leg distances in miles. The table length defines the leg count.
pub const DEFAULT_DISTANCES: [f64; 36] = [
    5.8, 4.0, 5.7, 6.3, 4.2, 6.4, 5.4, 5.3, 3.9, 5.7, 6.8, 4.5, 5.2, 4.1, 6.5, 3.8, 5.9, 4.4, 6.1,
    5.0, 4.7, 7.1, 3.5, 5.6, 4.9, 6.2, 4.3, 5.5, 3.7, 6.6, 4.8, 5.1, 4.6, 6.0, 3.6, 5.2,
];

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Durable identity assigned by the remote record store.
    RemoteId
);
string_id!(
    /// Team identity; scopes remote records and persisted local state.
    TeamId
);
string_id!(
    /// Stable per-device identifier, used as the origin tag of broadcasts.
    DeviceId
);

/// Support van a runner travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Van {
    One,
    Two,
}

impl Van {
    /// Van number as displayed (1 or 2).
    pub const fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl TryFrom<u8> for Van {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(format!("van must be 1 or 2, got {other}")),
        }
    }
}

impl From<Van> for u8 {
    fn from(van: Van) -> Self {
        van.number()
    }
}

/// Van a placeholder runner is assigned to: first half of the roster rides van 1.
pub const fn default_van_for(id: RunnerId) -> Van {
    if id as usize <= RUNNER_COUNT / 2 {
        Van::One
    } else {
        Van::Two
    }
}

/// A team member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    pub name: String,
    /// Seconds per mile.
    pub pace: u32,
    pub van: Van,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Runner {
    /// Create a runner without sync metadata.
    pub fn new(id: RunnerId, name: impl Into<String>, pace: u32, van: Van) -> Self {
        Self {
            id,
            remote_id: None,
            name: name.into(),
            pace,
            van,
            updated_at: None,
        }
    }

    /// Deterministic stand-in used whenever a runner is missing or invalid.
    pub fn placeholder(id: RunnerId) -> Self {
        Self::new(id, format!("Runner {id}"), DEFAULT_PACE_SECS, default_van_for(id))
    }

    /// Attach a remote identity.
    #[must_use]
    pub fn with_remote_id(mut self, remote_id: RemoteId) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    /// Stamp the last update time.
    #[must_use]
    pub const fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// A runner is usable for scheduling when its id and pace are positive.
    pub const fn is_valid(&self) -> bool {
        self.id > 0 && self.pace > 0
    }
}

/// The 12 placeholder runners a team starts with.
pub fn default_runners() -> Vec<Runner> {
    (1..=RUNNER_COUNT as RunnerId).map(Runner::placeholder).collect()
}

/// One runner's segment of the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub id: LegId,
    pub runner_id: RunnerId,
    /// Miles.
    pub distance: f64,
    pub projected_start: Timestamp,
    pub projected_finish: Timestamp,
    #[serde(default)]
    pub actual_start: Option<Timestamp>,
    #[serde(default)]
    pub actual_finish: Option<Timestamp>,
    /// Seconds per mile, overriding the runner's pace for this leg only.
    #[serde(default)]
    pub pace_override: Option<u32>,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Leg {
    /// Create an unscheduled leg.
    pub const fn new(id: LegId, runner_id: RunnerId, distance: f64) -> Self {
        Self {
            id,
            runner_id,
            distance,
            projected_start: 0,
            projected_finish: 0,
            actual_start: None,
            actual_finish: None,
            pace_override: None,
            remote_id: None,
            updated_at: None,
        }
    }

    /// `actual_start` when recorded, the projection otherwise.
    pub fn effective_start(&self) -> Timestamp {
        self.actual_start.unwrap_or(self.projected_start)
    }

    /// `actual_finish` when recorded, the projection otherwise.
    pub fn effective_finish(&self) -> Timestamp {
        self.actual_finish.unwrap_or(self.projected_finish)
    }

    /// Started and not yet finished.
    pub const fn is_running(&self) -> bool {
        self.actual_start.is_some() && self.actual_finish.is_none()
    }

    pub const fn is_started(&self) -> bool {
        self.actual_start.is_some()
    }

    pub const fn is_finished(&self) -> bool {
        self.actual_finish.is_some()
    }
}

/// Complete race snapshot for one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceState {
    /// Official race start.
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    pub runners: Vec<Runner>,
    #[serde(default)]
    pub legs: Vec<Leg>,
}

impl Default for RaceState {
    fn default() -> Self {
        Self {
            start_time: None,
            runners: default_runners(),
            legs: Vec::new(),
        }
    }
}

impl RaceState {
    /// Legs are materialized.
    pub fn is_initialized(&self) -> bool {
        !self.legs.is_empty()
    }

    pub fn runner(&self, id: RunnerId) -> Option<&Runner> {
        self.runners.iter().find(|r| r.id == id)
    }

    pub fn leg(&self, id: LegId) -> Option<&Leg> {
        self.legs.iter().find(|l| l.id == id)
    }

    /// Position of a leg in the ordered list.
    pub fn leg_index(&self, id: LegId) -> Option<usize> {
        self.legs.iter().position(|l| l.id == id)
    }
}
