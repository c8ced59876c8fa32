//! Notification delivery for low-priority race events.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::bus::EventHandler;
use crate::error::Result;
use crate::event::{RaceEvent, RacePayload};

const DEFAULT_HISTORY: usize = 64;

/// A rendered user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    /// Render a notification for a race progress event. Sync events render nothing.
    pub fn from_event(event: &RaceEvent) -> Option<Self> {
        let (title, body) = match &event.payload {
            RacePayload::LegStarted { leg_id, runner_id, .. } => (
                format!("Leg {leg_id} started"),
                format!("Runner {runner_id} is on the course"),
            ),
            RacePayload::LegFinished { leg_id, runner_id, .. } => (
                format!("Leg {leg_id} finished"),
                format!("Runner {runner_id} completed leg {leg_id}"),
            ),
            RacePayload::Handoff { from_leg, to_leg, .. } => (
                "Handoff".to_string(),
                format!("Leg {from_leg} handed off to leg {to_leg}"),
            ),
            RacePayload::RaceFinished { .. } => (
                "Race finished".to_string(),
                "The final leg is complete".to_string(),
            ),
            RacePayload::RunnerUpdated { .. }
            | RacePayload::LegUpdated { .. }
            | RacePayload::RaceDataReplaced
            | RacePayload::StartTimeChanged { .. }
            | RacePayload::StateReset { .. } => return None,
        };
        Some(Self { title, body })
    }
}

/// Logs notifications and keeps a short history of what was shown.
#[derive(Debug)]
pub struct LoggingNotificationSink {
    history: Mutex<VecDeque<Notification>>,
    capacity: usize,
}

impl Default for LoggingNotificationSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }
}

impl LoggingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Most recent notifications, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventHandler for LoggingNotificationSink {
    async fn handle(&self, event: &RaceEvent) -> Result<()> {
        let Some(notification) = Notification::from_event(event) else {
            return Ok(());
        };
        info!(title = %notification.title, body = %notification.body, "Race notification");

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(notification);
        Ok(())
    }

    fn name(&self) -> &str {
        "notifications"
    }
}

#[cfg(test)]
mod tests {
    use baton_core::Runner;

    use super::*;

    #[tokio::test]
    async fn should_record_progress_notifications() {
        let sink = LoggingNotificationSink::with_capacity(2);

        for payload in [
            RacePayload::LegStarted { leg_id: 1, runner_id: 1, at: 0 },
            RacePayload::Handoff { from_leg: 1, to_leg: 2, at: 10 },
            RacePayload::RaceFinished { at: 20 },
        ] {
            let handled = sink.handle(&RaceEvent::local(payload)).await;
            assert!(handled.is_ok());
        }

        let titles: Vec<String> = sink.history().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Handoff".to_string(), "Race finished".to_string()]);
    }

    #[tokio::test]
    async fn should_ignore_sync_events() {
        let sink = LoggingNotificationSink::new();
        let event = RaceEvent::local(RacePayload::RunnerUpdated {
            runner: Runner::placeholder(3),
        });

        assert!(sink.handle(&event).await.is_ok());
        assert!(sink.history().is_empty());
    }
}
