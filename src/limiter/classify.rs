//! Failure classification and retry-delay policy.
//!
//! Both functions are pure: the limiter's control flow calls them and emits
//! its own log events, keeping policy separate from observability.

use std::time::Duration;

use crate::limiter::types::{FailureClass, ProviderFailure, RateLimiterConfig};

/// Classify a provider failure into a retry category.
///
/// Structured fields win: a status code or retry hint is authoritative.
/// Without them, substring heuristics on the message decide — best-effort
/// only, since providers wrap errors inconsistently. Unrecognized failures
/// are treated as non-retryable rather than hammered blindly.
pub fn classify(failure: &ProviderFailure) -> FailureClass {
    if let Some(status) = failure.status {
        return match status {
            429 => FailureClass::QuotaExceeded {
                retry_after: failure.retry_after,
            },
            408 => FailureClass::Transient,
            500..=599 => FailureClass::ServerError,
            _ => FailureClass::NonRetryable,
        };
    }

    let message = failure.message.to_ascii_lowercase();
    if message.contains("rate limit")
        || message.contains("too many requests")
        || message.contains("quota")
        || message.contains("secondary limit")
    {
        FailureClass::QuotaExceeded {
            retry_after: failure.retry_after,
        }
    } else if message.contains("timed out")
        || message.contains("timeout")
        || message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("dns")
        || message.contains("temporarily")
    {
        FailureClass::Transient
    } else if message.contains("internal server error")
        || message.contains("bad gateway")
        || message.contains("service unavailable")
        || message.contains("overloaded")
    {
        FailureClass::ServerError
    } else {
        FailureClass::NonRetryable
    }
}

/// Delay before retry attempt `attempt` (1-based), or `None` to propagate.
pub fn retry_delay(
    class: &FailureClass,
    attempt: u32,
    config: &RateLimiterConfig,
) -> Option<Duration> {
    let delay = match class {
        FailureClass::QuotaExceeded { retry_after } => {
            retry_after.unwrap_or(config.default_quota_delay)
        }
        FailureClass::Transient => config.transient_retry_delay,
        FailureClass::ServerError => {
            // Exponent capped so the multiplier cannot overflow; the
            // configured ceiling still applies afterwards.
            config.base_retry_delay * 2u32.pow(attempt.saturating_sub(1).min(5))
        }
        FailureClass::NonRetryable => return None,
    };
    Some(delay.min(config.max_retry_delay))
}
