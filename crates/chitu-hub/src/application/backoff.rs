//! Capped exponential backoff with jitter for session reconnects.

use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy.
///
/// The base delay doubles with every consecutive failure, starting at
/// `floor` and never exceeding `ceiling`.  Up to `jitter` (a fraction, e.g.
/// `0.2` for 20 %) is added on top so that a fleet of printers that dropped
/// together does not reconnect in lockstep; the jittered value is clamped to
/// `ceiling` as well.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `consecutive_failures` failures,
    /// without jitter.  Zero or one failure yields the floor.
    pub fn base_delay(&self, consecutive_failures: u32) -> Duration {
        let shift = consecutive_failures.saturating_sub(1).min(16);
        self.floor
            .saturating_mul(1u32 << shift)
            .min(self.ceiling)
    }

    /// [`base_delay`](Self::base_delay) plus random jitter.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let base = self.base_delay(consecutive_failures);
        // NaN, negative or infinite fractions mean no jitter.
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        base.mul_f64(1.0 + extra).min(self.ceiling)
    }
}
