//! Exponential-backoff policy for the telemetry connection.
//!
//! [`RetryState`] is owned by the supervisor: every failed attempt calls
//! [`RetryState::record_failure`], which either hands back the delay to
//! wait before the next attempt or reports that the attempt budget is
//! spent. A successful handshake calls [`RetryState::reset`].

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Consecutive failed attempts after which the supervisor gives up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`] and never shrinks
/// below the current delay.
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier.max(1.0)) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay).max(current.min(policy.max_delay))
}

/// What the supervisor should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// The attempt budget is spent.
    Exhausted,
}

/// Attempt counter and pending delay for the current failure streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts since the last successful connection.
    pub attempt: u32,
    /// Delay that will be used for the next scheduled retry.
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            next_delay: policy.base_delay,
        }
    }

    /// Back to `{0, base_delay}` after a successful connection.
    pub fn reset(&mut self, policy: &RetryPolicy) {
        *self = Self::new(policy);
    }

    /// Count a failed attempt and decide whether to retry.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= policy.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = self.next_delay;
        self.next_delay = next_delay(delay, policy);
        RetryDecision::Retry(delay)
    }
}
