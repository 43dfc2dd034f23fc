use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat group identifier, as issued by the chat platform.
pub type GroupId = i64;

/// Chat message identifier, unique within a group.
pub type ChatMessageId = i64;

/// Shortest TTL a context entry may be cached with.
pub const MIN_TTL_MINUTES: i64 = 1;

/// Longest TTL a context entry may be cached with (seven days).
pub const MAX_TTL_MINUTES: i64 = 10_080;

/// One message captured from a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub message_id: ChatMessageId,
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Cached conversation thread, keyed by `(group_id, thread_root_message_id)`.
///
/// Logically absent once `expires_at` passes, even while physically stored;
/// the sweep deletes such rows eventually, reads never surface them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContextEntry {
    pub group_id: GroupId,
    pub thread_root_message_id: ChatMessageId,
    pub messages: Vec<ContextMessage>,
    /// Set on first cache of the thread and preserved across re-caches.
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Upsert request for [`ConversationContextCache::cache_context`](crate::context::ConversationContextCache::cache_context).
#[derive(Debug, Clone)]
pub struct CacheContextRequest {
    pub group_id: GroupId,
    pub thread_root_message_id: ChatMessageId,
    pub messages: Vec<ContextMessage>,
    pub ttl_minutes: i64,
}

/// One-pass census of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error(
        "ttl must be between {MIN_TTL_MINUTES} and {MAX_TTL_MINUTES} minutes, got {0}"
    )]
    InvalidTtl(i64),
    #[error("no valid context for group {group_id} thread {thread_root_message_id}")]
    NotFound {
        group_id: GroupId,
        thread_root_message_id: ChatMessageId,
    },
}
