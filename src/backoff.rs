//! Exponential backoff with jitter for worker retries

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::WorkerSettings;

/// Retry delays for one failing operation.
///
/// Each delay is `base * 2^attempt` plus up to 50% random jitter, capped at
/// `max`. Delays never shrink from one attempt to the next, even when the
/// jitter of an earlier attempt happened to be large.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
    last_ms: u64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_rng(base, max, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests
    pub fn seeded(base: Duration, max: Duration, seed: u64) -> Self {
        Self::with_rng(base, max, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: Duration, max: Duration, rng: StdRng) -> Self {
        let max_ms = max.as_millis() as u64;
        Self {
            base_ms: (base.as_millis() as u64).min(max_ms),
            max_ms,
            attempt: 0,
            last_ms: 0,
            rng,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Delay before the next retry
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.attempt.min(63));
        let raw = self.base_ms.saturating_mul(multiplier).min(self.max_ms);

        // Add random jitter (0-50% of delay)
        let jitter = if raw > 0 { self.rng.gen_range(0..=raw / 2) } else { 0 };
        let delay = raw.saturating_add(jitter).min(self.max_ms).max(self.last_ms);

        self.attempt = self.attempt.saturating_add(1);
        self.last_ms = delay;
        Duration::from_millis(delay)
    }

    /// Retries handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_ms = 0;
    }
}
