//! Priority event bus.
//!
//! Two FIFO queues: the high queue is always drained completely before the
//! low queue is touched, and the low queue is processed in bounded batches
//! with a short pause in between so high-priority work published mid-drain is
//! picked up promptly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use baton_core::BusConfig;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{EventId, EventKind, Priority, RaceEvent};

/// A subscriber on the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged and counted; they never reach the publisher.
    async fn handle(&self, event: &RaceEvent) -> Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Pattern for filtering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match events by kind.
    ByKind(EventKind),
    /// Match events by multiple kinds.
    ByKinds(Vec<EventKind>),
    /// Match every event of one priority.
    ByPriority(Priority),
}

impl EventPattern {
    /// Check if an event matches this pattern.
    pub fn matches(&self, event: &RaceEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByKind(kind) => event.kind() == *kind,
            Self::ByKinds(kinds) => kinds.contains(&event.kind()),
            Self::ByPriority(priority) => event.priority() == *priority,
        }
    }
}

/// Handle returned by [`PriorityEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published_high: u64,
    pub published_low: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published_high: AtomicU64,
    published_low: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

struct BusInner {
    high: Mutex<VecDeque<RaceEvent>>,
    low: Mutex<VecDeque<RaceEvent>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    processing: AtomicBool,
    idle: Notify,
    counters: Counters,
    config: BusConfig,
}

impl BusInner {
    fn pop_high(&self) -> Option<RaceEvent> {
        self.high.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn take_low_batch(&self) -> Vec<RaceEvent> {
        let mut low = self.low.lock().unwrap_or_else(PoisonError::into_inner);
        let take = self.config.low_batch_size.max(1).min(low.len());
        low.drain(..take).collect()
    }

    fn has_high(&self) -> bool {
        !self.high.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    fn has_low(&self) -> bool {
        !self.low.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    fn has_pending(&self) -> bool {
        self.has_high() || self.has_low()
    }

    fn matching_handlers(&self, event: &RaceEvent) -> Vec<Arc<dyn EventHandler>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sub| sub.pattern.matches(event))
            .map(|sub| Arc::clone(&sub.handler))
            .collect()
    }

    async fn dispatch(&self, event: &RaceEvent) {
        for handler in self.matching_handlers(event) {
            match handler.handle(event).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = handler.name(),
                        event_kind = %event.kind(),
                        event_id = %event.event_id,
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }
    }
}

/// In-process publish/subscribe with high and low priority queues.
///
/// Cloning is cheap; clones share queues and subscribers.
#[derive(Clone)]
pub struct PriorityEventBus {
    inner: Arc<BusInner>,
}

impl Default for PriorityEventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl PriorityEventBus {
    /// Create a new bus.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                high: Mutex::new(VecDeque::new()),
                low: Mutex::new(VecDeque::new()),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                processing: AtomicBool::new(false),
                idle: Notify::new(),
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Register a handler for events matching `pattern`.
    pub fn subscribe(&self, pattern: EventPattern, handler: Arc<dyn EventHandler>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(handler = handler.name(), pattern = ?pattern, "Subscribing handler");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                pattern,
                handler,
            });
        id
    }

    /// Remove a handler; events already being dispatched may still reach it.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue an event and start processing if the bus is idle.
    pub fn publish(&self, event: RaceEvent) -> EventId {
        let event_id = event.event_id;
        debug!(
            event_id = %event_id,
            event_kind = %event.kind(),
            priority = ?event.priority(),
            "Publishing event"
        );

        match event.priority() {
            Priority::High => {
                self.inner.counters.published_high.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .high
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(event);
            }
            Priority::Low => {
                self.inner.counters.published_low.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .low
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(event);
            }
        }

        self.ensure_processing();
        event_id
    }

    /// Publish a batch in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = RaceEvent>) -> Vec<EventId> {
        events.into_iter().map(|event| self.publish(event)).collect()
    }

    fn ensure_processing(&self) {
        if !self.inner.has_pending() || self.inner.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(process(Arc::clone(&self.inner)));
            }
            Err(_) => {
                // Left queued until the next publish or drain inside a runtime.
                self.inner.processing.store(false, Ordering::Release);
                debug!("No runtime available, events stay queued");
            }
        }
    }

    /// Whether both queues are empty and nothing is being dispatched.
    pub fn is_idle(&self) -> bool {
        !self.inner.processing.load(Ordering::Acquire) && !self.inner.has_pending()
    }

    /// Number of queued (not yet dispatched) events per priority.
    pub fn pending(&self) -> (usize, usize) {
        let high = self.inner.high.lock().unwrap_or_else(PoisonError::into_inner).len();
        let low = self.inner.low.lock().unwrap_or_else(PoisonError::into_inner).len();
        (high, low)
    }

    /// Resolve once every queued event has been dispatched.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_processing();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published_high: c.published_high.load(Ordering::Relaxed),
            published_low: c.published_low.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
        }
    }
}

async fn process(inner: Arc<BusInner>) {
    loop {
        while let Some(event) = inner.pop_high() {
            inner.dispatch(&event).await;
        }

        let batch = inner.take_low_batch();
        if batch.is_empty() {
            inner.processing.store(false, Ordering::Release);
            // An event may have landed between the empty check and the flag reset.
            if inner.has_pending() && !inner.processing.swap(true, Ordering::AcqRel) {
                continue;
            }
            inner.idle.notify_waiters();
            return;
        }

        debug!(batch = batch.len(), "Processing low-priority batch");
        for event in &batch {
            inner.dispatch(event).await;
        }

        if inner.has_low() {
            tokio::time::sleep(inner.config.low_batch_delay()).await;
        }
    }
}
