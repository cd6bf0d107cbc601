// Reconnect Backoff - Delay before each connect retry
//
// A policy only decides how long to wait; whether to retry at all is bounded
// by the session's reconnect count.

use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

pub trait ReconnectPolicy: Send + Sync + Debug {
    /// Delay before retry number `attempt` (starting at 1)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay before every retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ReconnectPolicy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Delay grows by `multiplier` per retry up to `max_interval`,
/// optionally spread by a randomization factor in `[0.0, 1.0]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.0,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval.max(self.initial_interval);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, randomization_factor: f64) -> Self {
        self.randomization_factor = randomization_factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before jitter is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.randomization_factor == 0.0 || base.is_zero() {
            return base;
        }
        let millis = base.as_millis() as f64;
        let spread = millis * self.randomization_factor;
        let jittered = rand::thread_rng().gen_range((millis - spread)..=(millis + spread));
        Duration::from_millis(jittered.min(self.max_interval.as_millis() as f64) as u64)
    }
}
