use std::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Backoff between flush attempts, and how many consecutive failures a batch may take.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.filter(|n| *n > 0);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Time to wait after the `attempt`-th consecutive failure (zero-based).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (Some(candidate), None) => candidate,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }

    /// Whether a batch that has failed `attempts` times in a row should be given up on.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(10)),
            max_attempts: None,
        }
    }
}
