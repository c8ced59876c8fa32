//! Retry logic with per-attempt timeout and exponential backoff.
//!
//! [`retry`] never returns `Err`: it reports a [`RetryOutcome`] so callers can
//! branch on partial failure. [`Retrier`] adds a registry of named circuit
//! breakers around each attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 10;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one (at least 1 is always made)
    pub max_attempts: u32,
    /// Timeout applied to each attempt; `None` waits indefinitely
    pub attempt_timeout: Option<Duration>,
    /// Delay schedule between attempts
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: Some(Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS)),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout: Some(attempt_timeout),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Create a retry state for tracking attempts.
    pub fn state(&self) -> RetryState {
        RetryState::new(self.max_attempts)
    }
}

/// Why an attempt (or the whole retry) failed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },
    #[error(transparent)]
    Operation(E),
}

impl<E> RetryError<E> {
    /// The wrapped operation error, if that is what failed.
    pub const fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Timeout(_) | Self::CircuitOpen { .. } => None,
        }
    }
}

/// Result record of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<RetryError<E>>,
    pub attempts: u32,
    pub total_time: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    fn succeeded(data: T, attempts: u32, started: Instant) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            attempts,
            total_time: started.elapsed(),
        }
    }

    fn failed(error: RetryError<E>, attempts: u32, started: Instant) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            attempts,
            total_time: started.elapsed(),
        }
    }

    /// Collapse into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the last recorded error when the operation did not succeed.
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(RetryError::Timeout(self.total_time)),
        }
    }
}

/// Attempt counter as a small state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    max_attempts: u32,
    attempts: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry; `backoff_index` is the 0-indexed position in the backoff schedule
    Retry { backoff_index: u32 },
    GiveUp,
}

impl RetryState {
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            attempts: 0,
        }
    }

    /// Record that an attempt is starting; returns its 1-indexed number.
    pub const fn begin_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Decide what follows a failed attempt.
    pub const fn on_failure(&self) -> RetryDecision {
        if self.attempts < self.max_attempts {
            RetryDecision::Retry {
                backoff_index: self.attempts.saturating_sub(1),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

async fn run_attempt<T, E, Fut>(
    attempt: Fut,
    timeout: Option<Duration>,
) -> Result<T, RetryError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result.map_err(RetryError::Operation),
            Err(_) => Err(RetryError::Timeout(limit)),
        },
        None => attempt.await.map_err(RetryError::Operation),
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is reached.
///
/// The closure receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(mut operation: F, config: &RetryConfig) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut state = config.state();

    loop {
        let attempt = state.begin_attempt();
        match run_attempt(operation(attempt), config.attempt_timeout).await {
            Ok(data) => return RetryOutcome::succeeded(data, attempt, started),
            Err(error) => match state.on_failure() {
                RetryDecision::Retry { backoff_index } => {
                    let delay = config.backoff.delay_for(backoff_index);
                    debug!(attempt, error = %error, delay_ms = delay.as_millis(), "Attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(attempts = attempt, error = %error, "Retries exhausted");
                    return RetryOutcome::failed(error, attempt, started);
                }
            },
        }
    }
}

/// Retry runner with a registry of named circuit breakers.
#[derive(Debug, Default)]
pub struct Retrier {
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl Retrier {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.breaker_config.clone()));
        f(breaker)
    }

    /// Current state of a named breaker (`Closed` if it was never used).
    pub fn breaker_state(&self, name: &str) -> CircuitState {
        self.with_breaker(name, |b| b.state())
    }

    /// Close every breaker, e.g. after the network comes back.
    pub fn reset_breakers(&self) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.values_mut().for_each(CircuitBreaker::reset);
    }

    /// Like [`retry`], with each attempt gated by the breaker called `breaker`.
    ///
    /// An open breaker ends the retry immediately with `RetryError::CircuitOpen`.
    pub async fn run<T, E, F, Fut>(
        &self,
        breaker: &str,
        mut operation: F,
        config: &RetryConfig,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut state = config.state();

        loop {
            let attempt = state.begin_attempt();
            if !self.with_breaker(breaker, |b| b.try_acquire(Instant::now())) {
                debug!(breaker, attempt, "Call short-circuited by open breaker");
                return RetryOutcome::failed(
                    RetryError::CircuitOpen {
                        name: breaker.to_string(),
                    },
                    attempt,
                    started,
                );
            }

            let result = run_attempt(operation(attempt), config.attempt_timeout).await;
            match result {
                Ok(data) => {
                    self.with_breaker(breaker, CircuitBreaker::record_success);
                    return RetryOutcome::succeeded(data, attempt, started);
                }
                Err(error) => {
                    self.with_breaker(breaker, |b| b.record_failure(Instant::now()));
                    match state.on_failure() {
                        RetryDecision::Retry { backoff_index } => {
                            let delay = config.backoff.delay_for(backoff_index);
                            debug!(breaker, attempt, error = %error, delay_ms = delay.as_millis(), "Attempt failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            warn!(breaker, attempts = attempt, error = %error, "Retries exhausted");
                            return RetryOutcome::failed(error, attempt, started);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(50)).with_backoff(
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)).without_jitter(),
        )
    }

    #[test]
    fn test_retry_state_gives_up_after_max_attempts() {
        let mut state = RetryState::new(2);

        state.begin_attempt();
        assert_eq!(state.on_failure(), RetryDecision::Retry { backoff_index: 0 });
        state.begin_attempt();
        assert_eq!(state.on_failure(), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_state_zero_attempts_still_tries_once() {
        let mut state = RetryState::new(0);
        assert_eq!(state.begin_attempt(), 1);
        assert_eq!(state.on_failure(), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn should_succeed_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let outcome = retry(
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok(n) } }
            },
            &fast_config(3),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.data, Some(2));
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_last_error_when_exhausted() {
        let outcome: RetryOutcome<(), &str> = retry(|_| async { Err("down") }, &fast_config(2)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.error, Some(RetryError::Operation("down"))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_slow_attempts() {
        let outcome: RetryOutcome<(), &str> = retry(
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            &fast_config(1),
        )
        .await;

        assert!(matches!(outcome.error, Some(RetryError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_open_named_breaker_and_short_circuit() {
        let retrier = Retrier::new(CircuitBreakerConfig::new(2, Duration::from_secs(60)));
        let calls = AtomicU32::new(0);

        let first: RetryOutcome<(), &str> = retrier
            .run(
                "remote",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                &fast_config(2),
            )
            .await;
        assert!(!first.success);
        assert_eq!(retrier.breaker_state("remote"), CircuitState::Open);

        let second: RetryOutcome<(), &str> = retrier
            .run(
                "remote",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &fast_config(2),
            )
            .await;

        assert!(matches!(second.error, Some(RetryError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open breaker must not invoke the operation");
        assert_eq!(retrier.breaker_state("other"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn should_close_breakers_on_reset() {
        let retrier = Retrier::new(CircuitBreakerConfig::new(1, Duration::from_secs(60)));
        let _: RetryOutcome<(), &str> = retrier.run("remote", |_| async { Err("x") }, &fast_config(1)).await;
        assert_eq!(retrier.breaker_state("remote"), CircuitState::Open);

        retrier.reset_breakers();

        assert_eq!(retrier.breaker_state("remote"), CircuitState::Closed);
    }
}
