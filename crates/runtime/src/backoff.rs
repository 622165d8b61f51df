use std::time::Duration;

use rand::Rng;

/// Retry policy for transient failures: exponential backoff with jitter.
///
/// The nominal delay before retry `n` (0-based) is `base * 2^n`, capped at
/// `max`. The actual delay is the nominal delay multiplied by a uniformly
/// random factor in `[1, 2)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts_made` have failed.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub fn nominal_delay(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Inclusive lower and exclusive upper bound of the jittered delay.
    pub fn delay_bounds(&self, retry_index: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(retry_index);
        (nominal, nominal * 2)
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, retry_index: u32, rng: &mut R) -> Duration {
        let jitter: f64 = rng.gen_range(1.0..2.0);
        self.nominal_delay(retry_index).mul_f64(jitter)
    }

    pub fn delay(&self, retry_index: u32) -> Duration {
        self.delay_with(retry_index, &mut rand::thread_rng())
    }
}
