use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy the dispatcher uses to space out delivery attempts.
///
/// Waits grow linearly with the attempt number (1x, 2x, ... the base
/// interval), not exponentially: with three bounded attempts there is no
/// runaway backoff to protect against, and the total worst-case stall per
/// record stays easy to reason about.
pub struct RetryPolicy {
    /// The wait before the second attempt; later waits are multiples of it.
    base_interval: time::Duration,
    /// The maximum possible wait between attempts.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(base_interval: time::Duration, maximum_interval: Option<time::Duration>) -> Self {
        Self {
            base_interval,
            maximum_interval,
        }
    }

    /// Calculate the wait after `attempt` (1-based) failed attempts before
    /// the next one may start.
    pub fn time_until_next_attempt(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.base_interval * attempt;

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}
