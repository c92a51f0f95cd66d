//! Retry schedule for the resilient transport.
//!
//! Each attempt's result is fed to [`RetrySchedule::observe`], which answers
//! with the next [`Step`]. The schedule owns the attempt counter and the
//! exponential backoff; callers only sleep and re-send.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubles after every failure.
    pub base_backoff: Duration,
    /// Upper bound applied to server-supplied `Retry-After` values.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

/// What one attempt produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Status {
        code: u16,
        retry_after: Option<Duration>,
    },
    TransportError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Success,
    /// Rate limited: wait (server hint or current backoff), then retry.
    RetryAfter(Duration),
    /// Generic failure: wait the current backoff, then retry.
    Backoff(Duration),
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempts: u32,
    backoff: Duration,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            backoff: policy.base_backoff,
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Backoff that the next generic failure would wait.
    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }

    pub fn observe(&mut self, observation: Observation) -> Step {
        self.attempts += 1;

        let wait = match observation {
            Observation::Status { code, .. } if code < 300 => return Step::Success,
            Observation::Status {
                code: 429,
                retry_after,
            } => Step::RetryAfter(
                retry_after
                    .filter(|d| !d.is_zero())
                    .map(|d| d.min(self.policy.max_retry_after))
                    .unwrap_or(self.backoff),
            ),
            _ => Step::Backoff(self.backoff),
        };
        self.backoff = self.backoff.saturating_mul(2);

        if self.attempts >= self.policy.max_attempts {
            return Step::Exhausted;
        }
        wait
    }
}

/// Parse a `Retry-After` header given in seconds. HTTP-date values are not
/// supported and yield `None`, which falls back to the current backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
