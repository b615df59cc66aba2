use std::time::Duration;

/// Exponential backoff between attempts of one delivery chain.
///
/// After attempt `n` fails, attempt `n + 1` is due `base * 2^n` later,
/// capped at `max`, plus up to `jitter` of random spread. With the default
/// one-minute base that is 2, 4, 8, ... minutes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(24 * 60 * 60),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay before the attempt following
    /// `failed_attempt`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let max = self.max.max(self.base);
        let factor = 2u32.checked_pow(failed_attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(max).min(max)
    }

    /// [`delay_after`](Self::delay_after) plus random jitter.
    pub fn next_delay(&self, failed_attempt: u32) -> Duration {
        self.delay_after(failed_attempt) + jitter_delay(self.jitter)
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
