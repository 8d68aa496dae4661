//! Delays between re-executions of a failed claim.

use std::time::Duration;

/// Retry budget and delay schedule of one stage run under the `retry` strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay after the first failure
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Re-executions allowed per claim after its first failure
    pub retries: u32,
    /// Spread of each delay, as a percentage of it (0-100)
    pub jitter_percent: u8,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retries: 0,
            jitter_percent: 10,
        }
    }
}

impl RetryBackoff {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        retries: u32,
        jitter_percent: u8,
    ) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            retries,
            jitter_percent: jitter_percent.min(100),
        }
    }

    /// Executions a claim may get in total.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Whether a claim that has failed `failures` times may run again.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.retries
    }

    /// Delay before claim `index` runs again after its `failures`-th failure.
    ///
    /// Doubles from `base_delay` per failure and saturates at `max_delay`. The
    /// jitter offset is picked from the claim index and failure count, so claims
    /// failing together on parallel workers spread out while any one claim's
    /// schedule is reproducible.
    pub fn delay(&self, index: usize, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);

        let spread = delay.mul_f64(f64::from(self.jitter_percent) / 100.0);
        if spread.is_zero() {
            return delay;
        }
        // Offset in {-1, -1/2, 0, 1/2, 1} of the spread.
        let slot = (index as u64)
            .wrapping_mul(7)
            .wrapping_add(u64::from(failures))
            % 5;
        match slot {
            0 => delay.saturating_sub(spread),
            1 => delay.saturating_sub(spread / 2),
            2 => delay,
            3 => delay.saturating_add(spread / 2),
            _ => delay.saturating_add(spread),
        }
    }
}
