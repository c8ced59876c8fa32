//! Realtime channel state and reconnection backoff.
//!
//! ```text
//! Unsubscribed -> Subscribing -> Subscribed
//!                      |              |
//!             (TimedOut | Error | Closed)
//!                      v
//!              RetryScheduled -> Subscribing      (while attempts remain)
//!                      |
//!                  Abandoned                      (until reset)
//! ```
//!
//! Transitions are plain methods; the caller owns the timers.

use std::fmt;
use std::time::Duration;

use baton_resilience::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One realtime channel per team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Runners,
    Legs,
    Broadcast,
}

impl Channel {
    pub const ALL: [Self; 3] = [Self::Runners, Self::Legs, Self::Broadcast];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runners => f.write_str("runners"),
            Self::Legs => f.write_str("legs"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    RetryScheduled { attempt: u32, delay: Duration },
    Abandoned,
}

/// Why a channel dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFailure {
    TimedOut,
    Error(String),
    Closed,
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::Error(reason) => write!(f, "error: {reason}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    channel: Channel,
    state: ChannelState,
    failures: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl SubscriptionTracker {
    pub fn new(channel: Channel, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            channel,
            state: ChannelState::Unsubscribed,
            failures: 0,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub const fn channel(&self) -> Channel {
        self.channel
    }

    pub const fn state(&self) -> ChannelState {
        self.state
    }

    /// Consecutive failures since the last successful subscribe.
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    pub const fn is_subscribed(&self) -> bool {
        matches!(self.state, ChannelState::Subscribed)
    }

    pub const fn is_abandoned(&self) -> bool {
        matches!(self.state, ChannelState::Abandoned)
    }

    /// Start a subscribe attempt. Refused once abandoned.
    pub fn begin(&mut self) -> bool {
        if self.is_abandoned() {
            return false;
        }
        self.state = ChannelState::Subscribing;
        debug!(channel = %self.channel, failures = self.failures, "Subscribing");
        true
    }

    pub fn on_subscribed(&mut self) {
        if self.failures > 0 {
            info!(channel = %self.channel, after_failures = self.failures, "Channel recovered");
        }
        self.state = ChannelState::Subscribed;
        self.failures = 0;
    }

    /// Record a failure. Returns the delay before the next attempt, or `None`
    /// when the channel is abandoned.
    pub fn on_failure(&mut self, failure: &ChannelFailure) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_attempts {
            self.state = ChannelState::Abandoned;
            warn!(channel = %self.channel, failures = self.failures, reason = %failure, "Channel abandoned");
            return None;
        }
        let delay = self.backoff.delay_for(self.failures.saturating_sub(1));
        self.state = ChannelState::RetryScheduled {
            attempt: self.failures,
            delay,
        };
        debug!(
            channel = %self.channel,
            attempt = self.failures,
            delay_ms = delay.as_millis(),
            reason = %failure,
            "Channel retry scheduled"
        );
        Some(delay)
    }

    /// Back to `Unsubscribed` with a clean failure count.
    pub fn reset(&mut self) {
        self.state = ChannelState::Unsubscribed;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_attempts: u32) -> SubscriptionTracker {
        SubscriptionTracker::new(
            Channel::Legs,
            max_attempts,
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000)).without_jitter(),
        )
    }

    #[test]
    fn should_back_off_exponentially_then_abandon() {
        let mut t = tracker(4);

        assert!(t.begin());
        assert_eq!(t.on_failure(&ChannelFailure::TimedOut), Some(Duration::from_millis(100)));
        assert!(t.begin());
        assert_eq!(t.on_failure(&ChannelFailure::Closed), Some(Duration::from_millis(200)));
        assert!(t.begin());
        assert_eq!(
            t.state(),
            ChannelState::Subscribing
        );
        assert_eq!(
            t.on_failure(&ChannelFailure::Error("boom".into())),
            Some(Duration::from_millis(400))
        );
        assert!(t.begin());
        assert_eq!(t.on_failure(&ChannelFailure::TimedOut), None);

        assert!(t.is_abandoned());
        assert!(!t.begin());
    }

    #[test]
    fn should_reset_failure_count_on_success() {
        let mut t = tracker(3);
        t.begin();
        t.on_failure(&ChannelFailure::TimedOut);
        t.begin();
        t.on_subscribed();

        assert!(t.is_subscribed());
        assert_eq!(t.failures(), 0);
    }

    #[test]
    fn should_leave_abandoned_state_only_through_reset() {
        let mut t = tracker(1);
        t.begin();
        assert_eq!(t.on_failure(&ChannelFailure::Closed), None);

        t.reset();

        assert_eq!(t.state(), ChannelState::Unsubscribed);
        assert!(t.begin());
    }
}
