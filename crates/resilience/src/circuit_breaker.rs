//! Circuit breaker pattern implementation.
//!
//! Prevents hammering a failing remote by short-circuiting calls after a run
//! of consecutive failures:
//! - Closed: Normal operation, requests pass through
//! - Open: Circuit is tripped, requests fail immediately
//! - Half-Open: One trial request decides whether to close or re-open
//!
//! Transitions take the current [`Instant`] as an argument so they can be
//! driven without real timers.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - rejecting requests
    Open,
    /// Circuit is half-open - testing recovery
    HalfOpen,
}

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config.
    pub const fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
        }
    }
}

/// Circuit breaker error types.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("circuit '{name}' is open")]
    Open { name: String },
    /// Inner error from the wrapped function
    #[error(transparent)]
    Inner(E),
}

/// Named circuit breaker counting consecutive failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current circuit state.
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub const fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Ask to send a request at `now`.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and grants exactly one trial; further requests are refused until that
    /// trial reports back.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout);
                if recovered {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, allowing trial request");
                }
                recovered
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// Record a failed request at `now`.
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        self.trial_in_flight = false;

        let trips = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trips {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            warn!(
                breaker = %self.name,
                failures = self.consecutive_failures,
                "Circuit opened"
            );
        }
    }

    /// Reset circuit breaker to initial state.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.last_failure_at = None;
        self.trial_in_flight = false;
    }

    /// Execute a future with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit refuses the call,
    /// otherwise the wrapped error.
    pub async fn call<F, T, E>(&mut self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire(Instant::now()) {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match f.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(Instant::now());
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "remote",
            CircuitBreakerConfig::new(threshold, Duration::from_millis(recovery_ms)),
        )
    }

    #[test]
    fn test_circuit_breaker_default_is_closed() {
        let mut b = breaker(3, 100);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire(Instant::now()));
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let mut b = breaker(3, 100);
        let now = Instant::now();

        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure(now);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire(now));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut b = breaker(3, 100);
        let now = Instant::now();

        b.record_failure(now);
        b.record_failure(now);
        b.record_success();
        b.record_failure(now);

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let mut b = breaker(1, 100);
        let opened = Instant::now();
        b.record_failure(opened);

        let later = opened + Duration::from_millis(150);
        assert!(b.try_acquire(later), "first call after recovery is the trial");
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.try_acquire(later), "second call must wait for the trial");
    }

    #[test]
    fn test_successful_trial_closes_circuit() {
        let mut b = breaker(1, 100);
        let opened = Instant::now();
        b.record_failure(opened);
        assert!(b.try_acquire(opened + Duration::from_millis(100)));

        b.record_success();

        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire(opened + Duration::from_millis(101)));
    }

    #[test]
    fn test_failed_trial_reopens_circuit() {
        let mut b = breaker(1, 100);
        let opened = Instant::now();
        b.record_failure(opened);
        let trial_at = opened + Duration::from_millis(120);
        assert!(b.try_acquire(trial_at));

        b.record_failure(trial_at);

        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire(trial_at + Duration::from_millis(50)));
        assert!(b.try_acquire(trial_at + Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_call_short_circuits_when_open() {
        let mut b = breaker(1, 60_000);
        let first: Result<(), _> = b.call(async { Err::<(), &str>("boom") }).await;
        assert!(matches!(first, Err(CircuitBreakerError::Inner("boom"))));

        let second = b.call(async { Ok::<u8, &str>(1) }).await;
        assert!(matches!(second, Err(CircuitBreakerError::Open { .. })));
    }
}
