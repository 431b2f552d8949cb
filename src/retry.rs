use crate::runner::RunError;
use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after a failed measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure: re-run the same iteration index after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Structural failure: end the run.
    Abort,
}

/// Retry policy for failed measurements.
///
/// Transient failures retry the same iteration in place: no row is written
/// and the index does not advance. There is no cap on attempts; the delay
/// between them grows exponentially up to `max_delay_secs`.
pub struct RetryPolicy {
    initial_delay_secs: u64,
    max_delay_secs: u64,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(initial_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            initial_delay_secs,
            max_delay_secs,
            current_attempt: 0,
        }
    }

    /// Classify a failure and decide what to do next.
    pub fn evaluate(&mut self, error: &RunError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Abort;
        }

        self.current_attempt += 1;
        let delay = Duration::from_secs(backoff_delay(
            self.initial_delay_secs,
            self.current_attempt - 1,
            self.max_delay_secs,
        ));
        warn!(
            error = %error,
            attempt = self.current_attempt,
            delay_secs = delay.as_secs(),
            "measurement failed, retrying same iteration"
        );
        RetryDecision::Retry {
            attempt: self.current_attempt,
            delay,
        }
    }

    /// Reset the attempt counter for a new iteration index.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Current attempt count (0 = no retries yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Returns `initial_delay * 2^consecutive_count`, capped at `max_delay`.
pub fn backoff_delay(initial_delay_secs: u64, consecutive_count: u32, max_delay_secs: u64) -> u64 {
    let shift = 1u64.checked_shl(consecutive_count).unwrap_or(u64::MAX);
    let delay = initial_delay_secs.saturating_mul(shift);
    delay.min(max_delay_secs)
}
