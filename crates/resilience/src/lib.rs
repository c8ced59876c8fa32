//! Retry and circuit breaking for remote calls.
//!
//! - [`retry`]: per-attempt timeout, exponential backoff with jitter, result record
//! - [`Retrier`]: the same, gated by named [`CircuitBreaker`]s
//! - [`BackoffPolicy`]: delay schedule shared with realtime reconnection

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::{retry, Retrier, RetryConfig, RetryDecision, RetryError, RetryOutcome, RetryState};
