use rand::Rng;
use std::time::Duration;

/// Exponential backoff with proportional jitter, capped at a maximum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub const DEFAULT_JITTER: f64 = 0.1;

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: Self::DEFAULT_JITTER,
        }
    }

    /// Sets the maximum fraction of the computed delay added as random
    /// jitter. Zero disables jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the delay before the next attempt after `failures`
    /// consecutive failures. The first failure waits `base`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max);

        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(1.0 + factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(300))
    }
}
