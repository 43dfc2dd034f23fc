//! # Chatrelay
//!
//! Concurrent dispatch core for relaying group-chat messages into tracked
//! code-host operations via an LLM classification step, under three
//! independently shaped external rate limits (chat API, code-host API,
//! language-model API), with bounded memory for conversation context and
//! idempotent operation logging.
//!
//! ## Architecture Overview
//!
//! The crate is a pure in-process coordination layer embedded by a bot
//! binary that owns the transports:
//!
//! - **[`limiter`]**: One parameterized token-bucket limiter instantiated
//!   per external service, combining a concurrency ceiling, minimum
//!   inter-job spacing, and a replenishing quota reservoir
//! - **[`queue`]**: Priority-ordered job queue with bounded concurrency,
//!   uniform dispatch pacing, and exponential-backoff-with-jitter retry
//! - **[`context`]**: TTL-bound cache of conversation threads with atomic
//!   upserts and a periodic expiry sweep
//! - **[`processor`]**: Message-processing state machine composing the
//!   above with the external collaborators, plus the setup-session store
//! - **[`config`]**: TOML-loadable tunables with production defaults
//! - **[`clock`]**: Injectable time source for deterministic expiry tests
//!
//! ## Key Features
//!
//! ### 🚦 Layered Backpressure
//! - **Independent limiters**: chat, code-host, and model budgets never
//!   couple; a quota stall on one service does not block the others
//! - **Composable retry**: provider-aware retries inside each limiter,
//!   generic jittered retries at the queue, each bounded in its own scope
//! - **Failure classification**: structured status codes and retry hints
//!   first, documented best-effort message heuristics as fallback
//!
//! ### 📬 Predictable Dispatch
//! - **Priority then FIFO**: urgent operations jump the line, equal
//!   priorities keep submission order, retries keep their place
//! - **Bounded everything**: concurrency ceilings, spacing floors, capped
//!   attempts, and TTL-swept caches keep resource growth finite
//!
//! ### 🧾 Traceable Outcomes
//! - **Idempotent operation log**: one record per attempted action,
//!   written whether execution succeeded, failed, or was skipped
//! - **Structured events**: every lifecycle edge emits a `tracing` event;
//!   aggregate metrics are queryable without blocking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatrelay::limiter::{ProviderFailure, RateLimiter, RateLimiterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Gate calls to the code host behind its tuned budget.
//!     let limiter = RateLimiter::new(RateLimiterConfig::code_host());
//!     let result = limiter
//!         .schedule("demo", || async { Ok::<_, ProviderFailure>("created #42") })
//!         .await;
//!     println!("{result:?}");
//! }
//! ```

/// Injectable wall-clock time source.
///
/// Production code uses [`clock::SystemClock`]; tests drive expiry
/// deterministically with [`clock::ManualClock`].
pub mod clock;

/// Relay configuration with TOML load/save and production defaults.
pub mod config;

/// TTL-bound conversation-context cache.
///
/// Maps `(group, thread root)` to an ordered message list with atomic
/// upserts, valid-only reads, and a periodic expiry sweep.
pub mod context;

/// Token-bucket rate limiting for external services.
///
/// One parameterized limiter type instantiated three times (chat,
/// code-host, model) with failure classification and retry policy.
pub mod limiter;

/// Message-processing state machine and collaborator seams.
///
/// Composes the limiters, queue, and caches into the per-message workflow,
/// and owns the setup-session store.
pub mod processor;

/// Priority-ordered dispatch queue with bounded concurrency and retry.
pub mod queue;

// Re-export the main composition types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ModelLimiterConfig, RelayConfig};
pub use context::{ConversationContextCache, ConversationContextEntry};
pub use limiter::{LimiterError, ProviderFailure, RateLimiter, RateLimiterConfig};
pub use processor::{
    Collaborators, InboundMessage, MessageProcessor, ProcessingReport, ProcessorError,
};
pub use queue::{PriorityJobQueue, QueueConfig, QueueError, QueueMetrics, StopMode};
