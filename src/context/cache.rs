use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::context::types::{
    CacheContextRequest, CacheError, CacheStats, ChatMessageId, ConversationContextEntry, GroupId,
    MAX_TTL_MINUTES, MIN_TTL_MINUTES,
};

/// TTL-bound cache of conversation threads.
///
/// Backs classification with recent thread history while bounding memory:
/// every entry carries an expiry, reads filter expired rows, and a periodic
/// sweep removes them. All mutations are single atomic map operations, so
/// concurrent upserts on one key cannot interleave partial updates.
#[derive(Debug)]
pub struct ConversationContextCache {
    entries: DashMap<(GroupId, ChatMessageId), ConversationContextEntry>,
    clock: Arc<dyn Clock>,
}

impl ConversationContextCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Upsert a thread's context with a fresh TTL.
    ///
    /// Creates the entry with `created_at = now` when absent; otherwise
    /// replaces the messages and expiry while preserving the original
    /// `created_at`. The expiry is always computed fresh — a stale row's old
    /// TTL is never resurrected.
    pub fn cache_context(&self, request: CacheContextRequest) -> Result<(), CacheError> {
        validate_ttl(request.ttl_minutes)?;
        let now = self.clock.now();
        let expires_at = now + ChronoDuration::minutes(request.ttl_minutes);
        let key = (request.group_id, request.thread_root_message_id);

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.messages = request.messages;
                entry.expires_at = expires_at;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ConversationContextEntry {
                    group_id: request.group_id,
                    thread_root_message_id: request.thread_root_message_id,
                    messages: request.messages,
                    created_at: now,
                    expires_at,
                });
            }
        }
        debug!(
            group_id = request.group_id,
            thread_root = request.thread_root_message_id,
            expires_at = %expires_at,
            "conversation context cached"
        );
        Ok(())
    }

    /// Fetch a thread's context, treating expired rows as absent.
    pub fn get_context(
        &self,
        group_id: GroupId,
        thread_root_message_id: ChatMessageId,
    ) -> Result<ConversationContextEntry, CacheError> {
        let now = self.clock.now();
        match self.entries.get(&(group_id, thread_root_message_id)) {
            Some(entry) if entry.expires_at > now => Ok(entry.value().clone()),
            _ => Err(CacheError::NotFound {
                group_id,
                thread_root_message_id,
            }),
        }
    }

    /// Validity check without cloning message content.
    pub fn has_valid_context(
        &self,
        group_id: GroupId,
        thread_root_message_id: ChatMessageId,
    ) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&(group_id, thread_root_message_id))
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    /// Remove every entry whose expiry has passed. Returns the count removed.
    pub fn invalidate_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, "swept expired conversation contexts");
        }
        removed
    }

    /// Explicitly drop one thread's context, expired or not.
    pub fn delete_context(&self, group_id: GroupId, thread_root_message_id: ChatMessageId) -> bool {
        self.entries
            .remove(&(group_id, thread_root_message_id))
            .is_some()
    }

    /// Drop every thread cached for a group. Returns the count removed.
    pub fn delete_group_contexts(&self, group_id: GroupId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(group, _), _| *group != group_id);
        before - self.entries.len()
    }

    /// Extend or shorten a live entry's expiry without touching its content.
    /// Expired-but-present rows count as absent.
    pub fn update_ttl(
        &self,
        group_id: GroupId,
        thread_root_message_id: ChatMessageId,
        ttl_minutes: i64,
    ) -> Result<DateTime<Utc>, CacheError> {
        validate_ttl(ttl_minutes)?;
        let now = self.clock.now();
        match self.entries.get_mut(&(group_id, thread_root_message_id)) {
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = now + ChronoDuration::minutes(ttl_minutes);
                Ok(entry.expires_at)
            }
            _ => Err(CacheError::NotFound {
                group_id,
                thread_root_message_id,
            }),
        }
    }

    /// Count total, valid, and expired entries in one pass.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            if entry.expires_at > now {
                stats.valid += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }

    /// Run `invalidate_expired` on a fixed interval until aborted.
    pub fn spawn_sweep_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh cache
            // is not swept before anything can expire.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.invalidate_expired();
            }
        })
    }
}

fn validate_ttl(ttl_minutes: i64) -> Result<(), CacheError> {
    if !(MIN_TTL_MINUTES..=MAX_TTL_MINUTES).contains(&ttl_minutes) {
        return Err(CacheError::InvalidTtl(ttl_minutes));
    }
    Ok(())
}
