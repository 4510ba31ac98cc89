//! Retry and backoff decisions, independent of any job store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::JobRecord;

/// Configuration for exponential retry backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single retry delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay_ms(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Delay scheduled after the given failed attempt.
    ///
    /// Formula: delay = min(base_delay * 2^(attempt-1), max_backoff)
    pub fn backoff_delay(&self, attempt: u16) -> Duration {
        compute_backoff_delay(attempt, self)
    }
}

/// Computes the retry delay for the `attempt`-th failed attempt (1-based).
pub fn compute_backoff_delay(attempt: u16, policy: &RetryPolicy) -> Duration {
    if attempt == 0 {
        return Duration::milliseconds(0);
    }

    let exp = (attempt - 1) as i32;
    let scaled = (policy.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(policy.max_backoff_ms as f64);

    Duration::milliseconds(capped.max(0.0) as i64)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeadLetterReason {
    /// The handler reported a failure that must not be retried.
    NonRetryable,
    /// Every allowed attempt has been used.
    Exhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::NonRetryable => "non_retryable",
            DeadLetterReason::Exhausted => "exhausted",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue the job once `available_at` has passed.
    Retry {
        delay: Duration,
        available_at: DateTime<Utc>,
    },
    /// Move the job to the dead-letter state.
    DeadLetter { reason: DeadLetterReason },
}

/// Turns a failed attempt into a retry or a dead-letter decision.
#[derive(Clone, Debug, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide what happens after attempt number `attempts` failed with `error`.
    ///
    /// `previous_available_at` keeps the schedule monotonic: a retry is never
    /// scheduled earlier than the time the job last became available.
    pub fn decide(
        &self,
        attempts: u16,
        max_attempts: u16,
        previous_available_at: DateTime<Utc>,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DeadLetter {
                reason: DeadLetterReason::NonRetryable,
            };
        }
        if attempts >= max_attempts {
            return RetryDecision::DeadLetter {
                reason: DeadLetterReason::Exhausted,
            };
        }

        let delay = self.policy.backoff_delay(attempts);
        let available_at = (now + delay).max(previous_available_at);
        RetryDecision::Retry {
            delay,
            available_at,
        }
    }

    pub fn decide_for(&self, job: &JobRecord, error: &JobError, now: DateTime<Utc>) -> RetryDecision {
        self.decide(job.attempts, job.max_attempts, job.available_at, error, now)
    }
}
