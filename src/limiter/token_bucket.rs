use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::limiter::classify::{classify, retry_delay};
use crate::limiter::types::{
    FailureClass, LimiterCounts, LimiterError, ProviderFailure, RateLimiterConfig,
};

/// Token-bucket limiter gating calls to one external service.
///
/// A job is admitted only when three constraints hold simultaneously: a free
/// concurrency slot, the minimum spacing since the previous job start, and a
/// non-empty reservoir. Admitted jobs run to a terminal outcome, with
/// classified failures retried under the limiter's own delay policy.
///
/// Three instances cover the relay's external services (chat, code-host,
/// model); they share no state.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    slots: Semaphore,
    admission: Mutex<AdmissionState>,
    queued: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug)]
struct AdmissionState {
    budget: RateBudget,
    last_start: Option<Instant>,
}

/// Replenishing reservoir modeling provider-side quota.
///
/// Mutated only by the owning limiter's admission/refill logic and the
/// one-way [`RateLimiter::resync_remaining`] entry point.
#[derive(Debug)]
struct RateBudget {
    capacity: u64,
    refill_amount: u64,
    refill_interval: Duration,
    remaining: u64,
    last_refill: Instant,
}

impl RateBudget {
    fn refill(&mut self, now: Instant) {
        if self.refill_interval.is_zero() || self.refill_amount == 0 {
            return;
        }
        let elapsed = now.duration_since(self.last_refill);
        let ticks = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u64;
        if ticks == 0 {
            return;
        }
        let restored = self.refill_amount.saturating_mul(ticks);
        self.remaining = self.remaining.saturating_add(restored).min(self.capacity);
        // Advance by whole ticks so the refill cadence stays stable.
        self.last_refill += self
            .refill_interval
            .saturating_mul(ticks.min(u32::MAX as u64) as u32);
    }

    fn next_refill_in(&self, now: Instant) -> Duration {
        (self.last_refill + self.refill_interval).saturating_duration_since(now)
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let budget = RateBudget {
            capacity: config.reservoir_capacity,
            refill_amount: config.refill_amount,
            refill_interval: config.refill_interval,
            remaining: config.reservoir_capacity,
            last_refill: Instant::now(),
        };
        Self {
            slots: Semaphore::new(config.max_concurrency.max(1)),
            admission: Mutex::new(AdmissionState {
                budget,
                last_start: None,
            }),
            queued: AtomicU64::new(0),
            running: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Run `op` under this limiter's admission and retry policy.
    ///
    /// `op` is re-invoked on each retry, so it must be a `Fn` producing a
    /// fresh future per call. Every attempt (initial or retry) counts as a
    /// job start for spacing and reservoir purposes.
    pub async fn schedule<T, F, Fut>(&self, label: &str, op: F) -> Result<T, LimiterError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderFailure>> + Send,
    {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let _slot = self
            .slots
            .acquire()
            .await
            .expect("limiter semaphore is never closed");
        self.admit().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);

        let result = self.run_attempts(label, &op).await;

        self.running.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Overwrite the reservoir from provider-authoritative remaining-quota
    /// data. Last-writer-wins with no reconciliation against in-flight local
    /// decrements; treat the value as tuning telemetry, not a guarantee.
    pub async fn resync_remaining(&self, reported: u64) {
        let mut state = self.admission.lock().await;
        let clamped = reported.min(state.budget.capacity);
        info!(
            limiter = %self.config.name,
            reported,
            applied = clamped,
            previous = state.budget.remaining,
            "reservoir resynchronized from provider data"
        );
        state.budget.remaining = clamped;
    }

    /// Current reservoir level, without triggering a refill.
    pub async fn reservoir_remaining(&self) -> u64 {
        self.admission.lock().await.budget.remaining
    }

    /// Non-blocking snapshot of job counts.
    pub fn counts(&self) -> LimiterCounts {
        LimiterCounts {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Wait until spacing and reservoir both admit a job start, then consume
    /// one reservoir unit and stamp the start time.
    async fn admit(&self) {
        loop {
            let wait = {
                let mut state = self.admission.lock().await;
                let now = Instant::now();
                state.budget.refill(now);

                let spacing_ready = state
                    .last_start
                    .map(|last| last + self.config.min_spacing)
                    .filter(|ready| *ready > now);

                if let Some(ready) = spacing_ready {
                    Some(ready.duration_since(now))
                } else if state.budget.remaining == 0 {
                    warn!(
                        limiter = %self.config.name,
                        "reservoir depleted; holding job until next refill"
                    );
                    Some(
                        state
                            .budget
                            .next_refill_in(now)
                            .max(Duration::from_millis(1)),
                    )
                } else {
                    state.budget.remaining -= 1;
                    state.last_start = Some(now);
                    None
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    async fn run_attempts<T, F, Fut>(&self, label: &str, op: &F) -> Result<T, LimiterError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderFailure>> + Send,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(limiter = %self.config.name, job = label, attempt, "job starting");
            match op().await {
                Ok(value) => {
                    debug!(limiter = %self.config.name, job = label, attempt, "job succeeded");
                    return Ok(value);
                }
                Err(failure) => {
                    let class = classify(&failure);
                    if class == FailureClass::NonRetryable {
                        warn!(
                            limiter = %self.config.name,
                            job = label,
                            attempt,
                            error = %failure,
                            "non-retryable failure; propagating"
                        );
                        return Err(LimiterError::NonRetryable(failure));
                    }
                    if attempt >= max_attempts {
                        warn!(
                            limiter = %self.config.name,
                            job = label,
                            attempts = attempt,
                            error = %failure,
                            "retries exhausted"
                        );
                        return Err(LimiterError::RetriesExhausted {
                            attempts: attempt,
                            last: failure,
                        });
                    }
                    let delay = retry_delay(&class, attempt, &self.config)
                        .unwrap_or(self.config.base_retry_delay);
                    warn!(
                        limiter = %self.config.name,
                        job = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "job failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    self.admit().await;
                }
            }
        }
    }
}
