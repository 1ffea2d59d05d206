use std::time::Duration as StdDuration;

use chrono::Duration;

/// Retry and timeout policy applied by the worker pool.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a one-off job is marked failed. Stored per job at
    /// creation, so changing it does not affect jobs already queued.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Per-execution bound; exceeding it counts as a failure.
    pub job_timeout: StdDuration,
    /// Processing jobs older than this are handed back to the dispatcher.
    pub reclaim_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::seconds(15),
            max_backoff: Duration::hours(1),
            job_timeout: StdDuration::from_secs(300),
            reclaim_timeout: Duration::minutes(15),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying a job that has now failed `attempt` times:
    /// `backoff_base * 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2i32.checked_pow(attempt).unwrap_or(i32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Whether a job that has failed `attempt` times in a row gets another go.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}
