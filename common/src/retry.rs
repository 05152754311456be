// Retry strategy implementation with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;

/// Default number of attempts for a transient failure
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-based).
    /// Returns None once the retry budget is spent.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Exponential backoff retry strategy with jitter
/// Sequence with defaults: 500ms, 1s, 2s, 4s ... capped at max_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_retries,
        }
    }

    /// base * 2^attempt, capped at max_delay
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Add random jitter to prevent thundering herd
    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
