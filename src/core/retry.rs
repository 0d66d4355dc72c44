//! Retry policy for failed jobs.
//!
//! A policy combines a retry budget with a delay table indexed by attempt
//! number. Attempts past the end of the table reuse its last entry.

use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 9;

/// Default backoff schedule: 1m, 5m, 30m, 1h, 3h, 6h, 12h, then 1d for every later attempt.
pub const DEFAULT_RETRY_DELAYS: [Duration; 8] = [
    Duration::from_secs(MINUTE),
    Duration::from_secs(5 * MINUTE),
    Duration::from_secs(30 * MINUTE),
    Duration::from_secs(HOUR),
    Duration::from_secs(3 * HOUR),
    Duration::from_secs(6 * HOUR),
    Duration::from_secs(12 * HOUR),
    Duration::from_secs(DAY),
];

/// Retry policy for a job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries, not including the initial attempt (0 = no retries).
    /// For example, `max_retries = 3` allows a total of 4 executions.
    pub max_retries: u32,

    /// Delay before retry `n` is `delays[n - 1]`; the last entry repeats.
    /// An empty table means retries are immediately due.
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays: Vec::new(),
        }
    }

    /// Create a policy with a fixed delay between retries.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delays: vec![delay],
        }
    }

    /// Create a policy with an explicit delay table.
    pub fn with_delays(max_retries: u32, delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            max_retries,
            delays: delays.into_iter().collect(),
        }
    }

    /// Check if another attempt is allowed given how many retries already happened.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Get the delay before the given retry attempt (1-indexed).
    ///
    /// Attempt `0` is treated as attempt `1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.max(1) as usize - 1;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    /// Nine retries on the 1m/5m/30m/1h/3h/6h/12h/1d schedule.
    fn default() -> Self {
        Self::with_delays(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAYS)
    }
}
