//! Retry backoff policy and delay generation.

use std::time::Duration;

use rand::Rng;

/// Backoff policy shared by group redelivery and dispatch publish
/// retries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryBackoff {
    max_retries: u32,
    first_backoff: Duration,
    jitter_factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            max_retries: 3,
            first_backoff: Duration::from_millis(100),
            jitter_factor: 0.5,
        }
    }
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_first_backoff(mut self, first_backoff: Duration) -> Self {
        self.first_backoff = first_backoff;
        self
    }

    /// Jitter as a fraction of the computed delay, clamped to `0.0..=1.0`.
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

/// Computes the cooperative delay to wait before processing a message
/// with a given retry count.
#[derive(Clone, Debug)]
pub struct WaitDelayGenerator {
    backoff: RetryBackoff,
}

impl WaitDelayGenerator {
    pub fn new(backoff: RetryBackoff) -> Self {
        WaitDelayGenerator { backoff }
    }

    /// Zero for a first delivery; otherwise `first_backoff * 2^(n-1)`
    /// randomized by the jitter factor. Counts past `max_retries` are
    /// capped so a stray header cannot produce unbounded sleeps.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 || self.backoff.max_retries == 0 {
            return Duration::ZERO;
        }
        let capped = retry_count.min(self.backoff.max_retries);
        let base = self.backoff.first_backoff * 2u32.saturating_pow(capped - 1);
        self.jitter(base)
    }

    fn jitter(&self, base: Duration) -> Duration {
        let factor = self.backoff.jitter_factor;
        if factor == 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - factor..=1.0 + factor);
        base.mul_f64(scale)
    }
}
