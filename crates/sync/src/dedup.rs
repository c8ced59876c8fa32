//! Broadcast signal deduplication.

use std::collections::HashMap;
use std::time::Duration;

use baton_core::DeviceId;
use baton_store::Table;
use tokio::time::Instant;
use tracing::debug;

use crate::remote::BroadcastSignal;

type SignalKey = (Table, DeviceId, i64);

/// Drops broadcast signals from this device and repeats of a signal already
/// seen within the window. Signals are equal when kind, sender and timestamp
/// (to the second) match.
#[derive(Debug)]
pub struct BroadcastDeduper {
    own_device: DeviceId,
    window: Duration,
    seen: HashMap<SignalKey, Instant>,
}

impl BroadcastDeduper {
    pub fn new(own_device: DeviceId, window: Duration) -> Self {
        Self {
            own_device,
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether `signal` should trigger a refetch. Records it when it does.
    pub fn should_process(&mut self, signal: &BroadcastSignal, now: Instant) -> bool {
        if signal.device_id == self.own_device {
            return false;
        }
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);

        let key = (
            signal.kind,
            signal.device_id.clone(),
            signal.timestamp.timestamp(),
        );
        if self.seen.contains_key(&key) {
            debug!(kind = %signal.kind, device = %signal.device_id, "Duplicate broadcast dropped");
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn signal(device: &str, millis: i64) -> BroadcastSignal {
        BroadcastSignal {
            kind: Table::Legs,
            device_id: DeviceId::from(device),
            timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
        }
    }

    fn deduper() -> BroadcastDeduper {
        BroadcastDeduper::new(DeviceId::from("me"), Duration::from_secs(5))
    }

    #[test]
    fn should_ignore_own_signals() {
        let mut d = deduper();
        assert!(!d.should_process(&signal("me", 1_000), Instant::now()));
        assert!(d.is_empty());
    }

    #[test]
    fn should_drop_repeats_within_the_same_second() {
        let mut d = deduper();
        let now = Instant::now();

        assert!(d.should_process(&signal("peer", 10_100), now));
        assert!(!d.should_process(&signal("peer", 10_900), now));
        assert!(d.should_process(&signal("peer", 11_000), now));
        assert!(d.should_process(&signal("other", 10_100), now));
    }

    #[test]
    fn should_forget_signals_after_the_window() {
        let mut d = deduper();
        let now = Instant::now();
        assert!(d.should_process(&signal("peer", 10_000), now));

        let later = now + Duration::from_secs(6);
        assert!(d.should_process(&signal("peer", 10_000), later));
        assert_eq!(d.len(), 1);
    }
}
