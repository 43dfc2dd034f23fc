use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::types::{
    AddOptions, JobFailure, QueueConfig, QueueError, QueueMetrics, StopMode,
};

type Executor<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, JobFailure>> + Send + Sync>;

/// Priority-ordered dispatch queue with bounded concurrency, uniform
/// dispatch pacing, and generic exponential-backoff retry.
///
/// Jobs dispatch in ascending priority order, FIFO within equal priority.
/// The queue treats every executor as opaque: it never inspects payload
/// semantics, and its retry layer is independent of (and composes with) any
/// limiter-level retry happening inside the job.
pub struct PriorityJobQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PriorityJobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Awaitable terminal outcome of one submitted job.
pub struct JobHandle<T> {
    id: String,
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve to the job's terminal outcome. Metrics are recorded whether
    /// or not this is ever awaited.
    pub async fn outcome(self) -> Result<T, QueueError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(QueueError::OutcomeLost))
    }
}

struct QueueInner<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    wake: Notify,
    slots: Arc<Semaphore>,
    running: AtomicUsize,
    in_backoff: AtomicUsize,
    stopped: AtomicBool,
    metrics: Mutex<MetricsState>,
}

struct QueueState<T> {
    heap: BinaryHeap<PendingJob<T>>,
    next_seq: u64,
    accepting: bool,
}

struct PendingJob<T> {
    priority: i64,
    seq: u64,
    id: String,
    attempt: u32,
    enqueued_at: DateTime<Utc>,
    context: Option<serde_json::Value>,
    executor: Executor<T>,
    reply: oneshot::Sender<Result<T, QueueError>>,
}

impl<T> PartialEq for PendingJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for PendingJob<T> {}

impl<T> PartialOrd for PendingJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PendingJob<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the lowest (priority, seq)
        // pair pops first. Retries keep their original seq, so a retried
        // job resumes its place instead of moving to the back.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct MetricsState {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    total_processing: Duration,
}

impl MetricsState {
    fn snapshot(&self) -> QueueMetrics {
        let average_processing_time = if self.processed > 0 {
            self.total_processing / self.processed as u32
        } else {
            Duration::ZERO
        };
        QueueMetrics {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            retried: self.retried,
            average_processing_time,
        }
    }
}

impl<T: Send + 'static> PriorityJobQueue<T> {
    /// Create the queue and start its dispatcher task. The dispatcher runs
    /// until `stop` is called; queues are expected to live for the process
    /// lifetime.
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(QueueInner {
            slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                accepting: true,
            }),
            wake: Notify::new(),
            running: AtomicUsize::new(0),
            in_backoff: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            metrics: Mutex::new(MetricsState::default()),
            config,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// Submit a job. The executor is re-invoked on each retry, so it must be
    /// a `Fn` producing a fresh future per call.
    pub async fn add<F, Fut>(
        &self,
        executor: F,
        opts: AddOptions,
    ) -> Result<JobHandle<T>, QueueError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, JobFailure>> + Send + 'static,
    {
        let executor: Executor<T> =
            Arc::new(move || -> BoxFuture<'static, Result<T, JobFailure>> {
                Box::pin(executor())
            });
        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().await;
            if !state.accepting {
                return Err(QueueError::NotAccepting);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            debug!(
                queue = %self.inner.config.name,
                job = %id,
                priority = opts.priority,
                seq,
                context = ?opts.context,
                "job enqueued"
            );
            state.heap.push(PendingJob {
                priority: opts.priority,
                seq,
                id: id.clone(),
                attempt: 0,
                enqueued_at: Utc::now(),
                context: opts.context,
                executor,
                reply: tx,
            });
        }
        self.inner.wake.notify_one();
        Ok(JobHandle { id, rx })
    }

    /// True when nothing is queued, running, or waiting out a retry backoff.
    pub async fn is_empty(&self) -> bool {
        let heap_empty = self.inner.state.lock().await.heap.is_empty();
        heap_empty
            && self.inner.running.load(Ordering::SeqCst) == 0
            && self.inner.in_backoff.load(Ordering::SeqCst) == 0
    }

    /// Poll until the queue is empty or the timeout elapses. Best-effort:
    /// a job submitted while waiting resets nothing, this is not a barrier.
    pub async fn wait_for_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap = self
                .inner
                .config
                .poll_interval
                .min(deadline.duration_since(now));
            tokio::time::sleep(nap).await;
        }
    }

    /// Stop accepting new jobs and shut the dispatcher down.
    ///
    /// `Drain` waits up to `drain_timeout` for queued and in-flight work;
    /// whatever is still waiting after that is rejected. `DropWaiting`
    /// rejects all not-yet-started jobs immediately; in-flight jobs run to
    /// completion either way.
    pub async fn stop(&self, mode: StopMode) {
        info!(queue = %self.inner.config.name, ?mode, "stopping queue");
        {
            self.inner.state.lock().await.accepting = false;
        }
        if mode == StopMode::Drain {
            let drained = self.wait_for_empty(self.inner.config.drain_timeout).await;
            if !drained {
                warn!(
                    queue = %self.inner.config.name,
                    "drain timed out with work still pending"
                );
            }
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.reject_waiting().await;
        self.inner.wake.notify_one();
    }

    pub async fn metrics(&self) -> QueueMetrics {
        self.inner.metrics.lock().await.snapshot()
    }

    async fn reject_waiting(&self) {
        let dropped: Vec<PendingJob<T>> = {
            let mut state = self.inner.state.lock().await;
            state.heap.drain().collect()
        };
        if dropped.is_empty() {
            return;
        }
        warn!(
            queue = %self.inner.config.name,
            count = dropped.len(),
            "rejecting waiting jobs at shutdown"
        );
        for job in dropped {
            let id = job.id;
            let _ = job.reply.send(Err(QueueError::Stopped { id: id.clone() }));
        }
    }
}

async fn dispatch_loop<T: Send + 'static>(inner: Arc<QueueInner<T>>) {
    let mut last_dispatch: Option<Instant> = None;
    loop {
        // Register for wakeups before inspecting the heap so a concurrent
        // push cannot slip between the check and the await.
        let wake = inner.wake.notified();
        let has_pending = { !inner.state.lock().await.heap.is_empty() };
        if !has_pending {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            wake.await;
            continue;
        }

        let permit = match Arc::clone(&inner.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if let Some(last) = last_dispatch {
            tokio::time::sleep_until(last + inner.config.min_dispatch_spacing).await;
        }
        let job = { inner.state.lock().await.heap.pop() };
        let Some(job) = job else {
            // Heap drained while pacing (shutdown raced us).
            drop(permit);
            continue;
        };
        last_dispatch = Some(Instant::now());
        inner.running.fetch_add(1, Ordering::SeqCst);
        debug!(
            queue = %inner.config.name,
            job = %job.id,
            priority = job.priority,
            attempt = job.attempt,
            enqueued_at = %job.enqueued_at,
            "job dispatched"
        );
        let task_inner = Arc::clone(&inner);
        tokio::spawn(run_job(task_inner, job, permit));
    }
    debug!(queue = %inner.config.name, "dispatcher stopped");
}

async fn run_job<T: Send + 'static>(
    inner: Arc<QueueInner<T>>,
    job: PendingJob<T>,
    permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let result = (job.executor)().await;
    let elapsed = started.elapsed();
    drop(permit);
    inner.running.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(value) => {
            record_terminal(&inner, elapsed, true).await;
            debug!(
                queue = %inner.config.name,
                job = %job.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "job succeeded"
            );
            let _ = job.reply.send(Ok(value));
            inner.wake.notify_one();
        }
        Err(failure) => {
            if job.attempt < inner.config.max_retries {
                {
                    inner.metrics.lock().await.retried += 1;
                }
                let delay = backoff_delay(&inner.config, job.attempt);
                warn!(
                    queue = %inner.config.name,
                    job = %job.id,
                    attempt = job.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "job failed; scheduling retry"
                );
                inner.in_backoff.fetch_add(1, Ordering::SeqCst);
                let retry_job = PendingJob {
                    attempt: job.attempt + 1,
                    ..job
                };
                let retry_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    requeue(retry_inner, retry_job).await;
                });
            } else {
                record_terminal(&inner, elapsed, false).await;
                error!(
                    queue = %inner.config.name,
                    job = %job.id,
                    attempts = job.attempt + 1,
                    error = %failure,
                    "job failed permanently"
                );
                let outcome = Err(QueueError::RetriesExhausted {
                    id: job.id.clone(),
                    attempts: job.attempt + 1,
                    last: failure,
                });
                let _ = job.reply.send(outcome);
                inner.wake.notify_one();
            }
        }
    }
}

async fn requeue<T>(inner: Arc<QueueInner<T>>, job: PendingJob<T>) {
    inner.in_backoff.fetch_sub(1, Ordering::SeqCst);
    if inner.stopped.load(Ordering::SeqCst) {
        let id = job.id;
        let _ = job.reply.send(Err(QueueError::Stopped { id: id.clone() }));
        return;
    }
    inner.state.lock().await.heap.push(job);
    inner.wake.notify_one();
}

async fn record_terminal<T>(inner: &QueueInner<T>, elapsed: Duration, success: bool) {
    let mut metrics = inner.metrics.lock().await;
    metrics.processed += 1;
    if success {
        metrics.succeeded += 1;
    } else {
        metrics.failed += 1;
    }
    metrics.total_processing += elapsed;
}

/// `base * 2^attempt` plus uniform jitter, where `attempt` counts retries
/// already spent. The jitter desynchronizes retry storms across jobs that
/// failed together.
fn backoff_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let exp = config.base_retry_delay.saturating_mul(2u32.pow(attempt.min(16)));
    let jitter_max = config.retry_jitter_max.as_millis() as u64;
    let jitter = if jitter_max == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..jitter_max))
    };
    exp.saturating_add(jitter)
}
