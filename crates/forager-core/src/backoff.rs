//! Exponential backoff with jitter for retry delays.
//!
//! One delay curve is shared by the fetch retry loop, proxy re-acquisition,
//! and the rate limiter's failure backoff, each with its own parameters.

use std::time::Duration;

/// Delay curve for retries: `base × 2^attempt`, capped, plus random jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for the exponential portion.
    pub cap: Duration,

    /// Maximum random jitter added on top (uniform [0, jitter)).
    ///
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl BackoffConfig {
    /// Create a config with the given base delay, a 60s cap, and no jitter.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: Duration::from_secs(60),
            jitter: Duration::ZERO,
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based):
    /// `min(base × 2^attempt, cap) + jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.cap.as_millis() as u64);
        Duration::from_millis(capped.saturating_add(rand_jitter_ms(self.jitter.as_millis() as u64)))
    }
}

impl Default for BackoffConfig {
    /// 500ms base doubling up to 60s, with 250ms jitter.
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Jitter from std only: xorshift64 seeded from the clock. Fine for
// spreading out retries, not for anything cryptographic.
// ---------------------------------------------------------------------------

pub(crate) fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
