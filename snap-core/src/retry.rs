use std::cmp::min;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Classification of a failed attempt. The variant decides whether the job is
/// eligible for automatic retry, and its display form is the stable,
/// user-visible failure reason (never the raw error text).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    InvalidUrl,
    Content,
    Internal,
    PoolExhausted,
    Unauthorized,
    InsufficientCredits,
}

impl FailureKind {
    /// Transient conditions are retried; conditions that cannot resolve on
    /// their own are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Timeout
            | FailureKind::Network
            | FailureKind::Internal
            | FailureKind::PoolExhausted => true,
            FailureKind::InvalidUrl
            | FailureKind::Content
            | FailureKind::Unauthorized
            | FailureKind::InsufficientCredits => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            FailureKind::Timeout => "page did not finish loading in time",
            FailureKind::Network => "target could not be reached",
            FailureKind::InvalidUrl => "target url is invalid",
            FailureKind::Content => "page content could not be captured",
            FailureKind::Internal => "internal error while processing",
            FailureKind::PoolExhausted => "no renderer was available",
            FailureKind::Unauthorized => "not authorized",
            FailureKind::InsufficientCredits => "insufficient credits",
        };
        write!(f, "{reason}")
    }
}

/// Exponential backoff with a cap and a little jitter, used to set
/// `next_retry_at` when requeuing a failed job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// The backoff interval before the first retry.
    initial_interval: Duration,
    /// Multiplier applied for every past attempt.
    backoff_coefficient: u32,
    /// The maximum possible backoff between retries.
    maximum_interval: Duration,
    /// Upper bound of the random jitter added on top of the backoff.
    maximum_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        backoff_coefficient: u32,
        maximum_interval: Duration,
        maximum_jitter: Duration,
    ) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            maximum_interval,
            maximum_jitter,
        }
    }

    /// Whether a job that just failed with `kind` should be requeued.
    /// `retry_count` is the number of retries already consumed.
    pub fn should_retry(&self, kind: FailureKind, retry_count: i32, max_retries: i32) -> bool {
        kind.is_retryable() && retry_count < max_retries
    }

    /// Delay before the next attempt, given the retries already consumed.
    /// First retry waits `initial_interval`, each one after doubles (by
    /// default), capped at `maximum_interval`.
    pub fn time_until_next_retry(&self, retry_count: u32) -> Duration {
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(retry_count));
        let capped = min(candidate, self.maximum_interval);

        let jitter_ms = self.maximum_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            backoff_coefficient: 2,
            maximum_interval: Duration::from_secs(30 * 60),
            maximum_jitter: Duration::from_secs(3),
        }
    }
}
