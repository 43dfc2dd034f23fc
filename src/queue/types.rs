use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::limiter::{LimiterError, ProviderFailure};

/// Priority assigned to jobs submitted without an explicit one.
pub const DEFAULT_JOB_PRIORITY: i64 = 50;

/// Tunables for a [`PriorityJobQueue`](crate::queue::PriorityJobQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Label used in structured log events.
    pub name: String,
    /// Maximum number of jobs executing at once.
    pub max_concurrency: usize,
    /// Minimum delay between consecutive dispatches, regardless of priority.
    pub min_dispatch_spacing: Duration,
    /// Retries after the initial attempt before a job fails permanently.
    pub max_retries: u32,
    /// Base delay for the exponential retry backoff.
    pub base_retry_delay: Duration,
    /// Upper bound of the uniform jitter added to each retry delay.
    pub retry_jitter_max: Duration,
    /// How long `stop(Drain)` waits for in-flight and queued work.
    pub drain_timeout: Duration,
    /// Polling cadence for `wait_for_empty`.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "dispatch".to_string(),
            max_concurrency: 2,
            min_dispatch_spacing: Duration::from_millis(250),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(500),
            retry_jitter_max: Duration::from_millis(1_000),
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Failure returned by a job executor.
///
/// The queue never interprets failure semantics; classification belongs to
/// the limiter wrapped inside the job. This is deliberately just a message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<LimiterError> for JobFailure {
    fn from(err: LimiterError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

impl From<ProviderFailure> for JobFailure {
    fn from(err: ProviderFailure) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// Terminal error surfaced through a [`JobHandle`](crate::queue::JobHandle).
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job {id} failed permanently after {attempts} attempts: {last}")]
    RetriesExhausted {
        id: String,
        attempts: u32,
        last: JobFailure,
    },
    #[error("queue stopped before job {id} started")]
    Stopped { id: String },
    #[error("queue is not accepting new jobs")]
    NotAccepting,
    #[error("job outcome channel closed")]
    OutcomeLost,
}

/// Submission options for [`PriorityJobQueue::add`](crate::queue::PriorityJobQueue::add).
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Lower values dispatch first.
    pub priority: i64,
    /// Caller-supplied id; a random one is generated when absent.
    pub id: Option<String>,
    /// Opaque context echoed into log events, never interpreted.
    pub context: Option<serde_json::Value>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_JOB_PRIORITY,
            id: None,
            context: None,
        }
    }
}

/// How `stop` treats jobs that have not started yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Attempt a bounded drain before halting.
    Drain,
    /// Immediately reject all not-yet-started jobs.
    DropWaiting,
}

/// Aggregate counters, updated on every terminal outcome whether or not the
/// caller awaits the job handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub average_processing_time: Duration,
}
