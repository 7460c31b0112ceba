use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy a worker uses to determine how far in the future a failed
/// job is rescheduled.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
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
        }
    }

    /// Calculate the time until the next retry of a job that has just failed
    /// its `attempt`th attempt (1-based, as reported by the queue).
    pub fn time_until_next_retry(&self, attempt: i32) -> time::Duration {
        let exponent = attempt.saturating_sub(1).max(0) as u32;
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(exponent);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}
