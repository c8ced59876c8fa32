//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Delay schedule: `min(base * 2^attempt, max)` plus up to `jitter_factor` of that.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the capped delay (0.0 disables jitter).
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the default jitter factor.
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Set jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Disable jitter.
    #[must_use]
    pub const fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    /// Capped exponential delay for a 0-indexed attempt, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay for a 0-indexed attempt using the thread-local RNG for jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay for a 0-indexed attempt using the given RNG for jitter.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.base_delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return capped;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jitter_ms = {
            let range = capped.as_millis() as f64 * self.jitter_factor;
            if range > 0.0 {
                rng.gen_range(0.0..range).floor() as u64
            } else {
                0
            }
        };

        capped.saturating_add(Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_capped() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500)).without_jitter();

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_millis(60_000))
            .with_jitter(0.2);

        for attempt in 0..5 {
            let base = policy.base_delay_for(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay >= base, "jitter must never shorten the delay");
            assert!(delay <= base + base.mul_f64(0.2), "jitter must stay within 20%");
        }
    }

    #[test]
    fn test_zero_base_delay_does_not_panic_with_jitter() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }
}
