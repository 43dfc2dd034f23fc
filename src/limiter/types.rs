use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Tunables for one [`RateLimiter`](crate::limiter::RateLimiter) instance.
///
/// Three instances exist in a running relay (chat, code-host, model), each
/// with its own shape. The reservoir models provider-side quota independent
/// of local pacing: it depletes by one per job start and replenishes by
/// `refill_amount` every `refill_interval`, capped at `reservoir_capacity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Label used in structured log events.
    pub name: String,
    /// Maximum number of jobs executing at once.
    pub max_concurrency: usize,
    /// Minimum delay between consecutive job starts.
    pub min_spacing: Duration,
    /// Reservoir ceiling.
    pub reservoir_capacity: u64,
    /// Amount restored per refill tick.
    pub refill_amount: u64,
    /// Interval between refill ticks.
    pub refill_interval: Duration,
    /// Retries after the initial attempt before giving up.
    pub max_retries: u32,
    /// Base delay for exponential server-error backoff.
    pub base_retry_delay: Duration,
    /// Ceiling for any computed backoff delay.
    pub max_retry_delay: Duration,
    /// Delay applied to quota failures that carry no provider hint.
    pub default_quota_delay: Duration,
    /// Fixed delay for transient network failures.
    pub transient_retry_delay: Duration,
}

impl RateLimiterConfig {
    /// Chat API shape: strictly serialized sends, ~30 messages per second.
    pub fn chat() -> Self {
        Self {
            name: "chat".to_string(),
            max_concurrency: 1,
            min_spacing: Duration::from_millis(33),
            reservoir_capacity: 30,
            refill_amount: 30,
            refill_interval: Duration::from_secs(1),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
            default_quota_delay: Duration::from_secs(5),
            transient_retry_delay: Duration::from_secs(1),
        }
    }

    /// Code-host API shape: paced writes under an hourly points budget,
    /// with room for the host's secondary limits.
    pub fn code_host() -> Self {
        Self {
            name: "code-host".to_string(),
            max_concurrency: 2,
            min_spacing: Duration::from_millis(720),
            reservoir_capacity: 100,
            refill_amount: 83,
            refill_interval: Duration::from_secs(60),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(120),
            default_quota_delay: Duration::from_secs(60),
            transient_retry_delay: Duration::from_secs(1),
        }
    }

    /// Language-model API shape derived from a requests-per-minute budget:
    /// spacing spreads the budget evenly, the reservoir equals the rate.
    pub fn model(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            name: "model".to_string(),
            max_concurrency: 3,
            min_spacing: Duration::from_millis(60_000 / rpm as u64),
            reservoir_capacity: rpm as u64,
            refill_amount: rpm as u64,
            refill_interval: Duration::from_secs(60),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            default_quota_delay: Duration::from_secs(20),
            transient_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Failure reported by a wrapped provider call.
///
/// Carries whatever structure the provider surfaced: an HTTP-like status
/// code and a retry hint when available, always a message. Classification
/// prefers the structured fields and only falls back to the message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderFailure {
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Outcome of classifying a [`ProviderFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Provider-side quota exhausted; wait for the hinted or default delay.
    QuotaExceeded { retry_after: Option<Duration> },
    /// Network-level hiccup worth a short fixed retry.
    Transient,
    /// 5xx-class provider fault; back off exponentially.
    ServerError,
    /// Not worth retrying; surface to the caller.
    NonRetryable,
}

/// Terminal error returned by [`RateLimiter::schedule`](crate::limiter::RateLimiter::schedule).
#[derive(Debug, Clone, Error)]
pub enum LimiterError {
    #[error("non-retryable failure: {0}")]
    NonRetryable(ProviderFailure),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderFailure },
}

impl LimiterError {
    /// The underlying provider failure, whichever way the job ended.
    pub fn failure(&self) -> &ProviderFailure {
        match self {
            LimiterError::NonRetryable(failure) => failure,
            LimiterError::RetriesExhausted { last, .. } => last,
        }
    }
}

/// Non-blocking snapshot of a limiter's job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterCounts {
    /// Jobs waiting for admission (spacing, reservoir, or a free slot).
    pub queued: u64,
    /// Jobs currently executing.
    pub running: u64,
    /// Jobs that reached a terminal outcome, success or failure.
    pub completed: u64,
}
