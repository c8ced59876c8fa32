//! Race events and the priority event bus.
//!
//! - **Events**: [`RaceEvent`] wraps a [`RacePayload`] with an id, [`Origin`] and timestamp
//! - **Bus**: [`PriorityEventBus`] delivers high-priority sync events before
//!   low-priority notification events
//! - **Sink**: [`LoggingNotificationSink`] renders progress events as notifications
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use baton_events::{EventPattern, LoggingNotificationSink, Priority, PriorityEventBus};
//!
//! let bus = PriorityEventBus::default();
//! bus.subscribe(
//!     EventPattern::ByPriority(Priority::Low),
//!     Arc::new(LoggingNotificationSink::new()),
//! );
//! bus.publish_all(store.start_runner(1, now)?);
//! bus.wait_idle().await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod sink;

pub use bus::{BusStats, EventHandler, EventPattern, PriorityEventBus, SubscriberId};
pub use error::{Error, Result};
pub use event::{EventId, EventKind, Origin, Priority, RaceEvent, RacePayload};
pub use sink::{LoggingNotificationSink, Notification};
