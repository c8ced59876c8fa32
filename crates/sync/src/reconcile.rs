//! Periodic reconciliation.
//!
//! Realtime notifications can be missed (dropped channels, lagged receivers,
//! devices asleep). The loop refetches on a fixed interval so every device
//! converges regardless.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::SyncCoordinator;
use crate::error::Result;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub applied: usize,
    pub replayed: usize,
    pub resubscribed: bool,
}

/// Fixed-interval refetch loop for one coordinator.
pub struct ReconciliationLoop {
    coordinator: SyncCoordinator,
    interval: Duration,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    pub fn new(coordinator: SyncCoordinator, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            coordinator,
            interval,
            stop_rx,
            stop_tx,
        }
    }

    /// Sender that stops the loop when `true` is sent.
    pub fn stop_handle(&self) -> watch::Sender<bool> {
        self.stop_tx.clone()
    }

    /// Run until stopped. Failed passes are logged and retried next tick.
    pub async fn run(&mut self) {
        info!(
            interval_ms = self.interval.as_millis(),
            team = %self.coordinator.team(),
            "Starting reconciliation loop"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile_once().await {
                        Ok(outcome) => debug!(?outcome, "Reconciliation pass complete"),
                        Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        info!("Reconciliation loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass: refetch both tables, replay a non-empty offline queue and
    /// resubscribe when no realtime channel is up. Skipped while offline.
    ///
    /// # Errors
    ///
    /// Returns the first remote error.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        if !self.coordinator.is_online() {
            debug!("Offline, skipping reconciliation");
            return Ok(outcome);
        }

        outcome.applied += self.coordinator.fetch_runners().await?.applied;
        outcome.applied += self.coordinator.fetch_legs().await?.applied;

        if self.coordinator.pending_changes() > 0 {
            outcome.replayed = self.coordinator.replay_offline_queue().await?.replayed;
        }
        if !self.coordinator.realtime_active() {
            self.coordinator.retry_realtime();
            outcome.resubscribed = true;
        }
        Ok(outcome)
    }
}
