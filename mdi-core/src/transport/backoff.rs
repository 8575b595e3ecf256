//! Exponential reconnection backoff with jitter.
//!
//! `delay(k) = min(base * 2^k, max) * (1 ± jitter)` where `k` counts the
//! consecutive failed attempts so far.

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Default jitter fraction applied either side of the nominal delay.
pub const DEFAULT_JITTER: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    /// `0` means unlimited.
    max_attempts: u32,
    jitter: f64,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
            jitter: DEFAULT_JITTER,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_max_delay(),
            config.max_reconnect_attempts,
        )
    }

    /// Override the jitter fraction (clamped to `[0, 1)`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.999);
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before jitter: `min(base * 2^attempt, max)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor)
    }
}
