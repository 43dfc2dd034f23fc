//! Process-wide store for multi-step setup conversations.
//!
//! Linking a group to a repository takes several messages (pick the
//! repository, tune defaults, confirm). The in-between state lives here
//! rather than in an ambient global: created on `begin`, mutated only
//! through `advance`, removed on `complete`/`cancel` or by the TTL sweep —
//! the same sweep pattern the context cache uses.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::context::GroupId;

/// Chat user identifier, as issued by the chat platform.
pub type UserId = i64;

/// Where a setup conversation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupStage {
    AwaitingRepository,
    AwaitingPreferences,
    Confirming,
}

/// Configuration collected so far during setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupDraft {
    pub repository: Option<String>,
    pub context_ttl_minutes: Option<i64>,
    pub min_confidence: Option<f32>,
}

/// One user's in-flight setup conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupSession {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub stage: SetupStage,
    pub draft: SetupDraft,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("user {0} has no active setup session")]
    NoActiveSession(UserId),
}

/// TTL-bound map of active setup sessions, keyed by user.
#[derive(Debug)]
pub struct SetupSessionStore {
    sessions: DashMap<UserId, SetupSession>,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl SetupSessionStore {
    pub fn new(ttl_minutes: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: ChronoDuration::minutes(ttl_minutes.max(1)),
            clock,
        }
    }

    /// Start (or restart) a setup conversation for a user. Any previous
    /// session for the same user is replaced.
    pub fn begin(&self, user_id: UserId, group_id: GroupId) -> SetupSession {
        let now = self.clock.now();
        let session = SetupSession {
            user_id,
            group_id,
            stage: SetupStage::AwaitingRepository,
            draft: SetupDraft::default(),
            started_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions.insert(user_id, session.clone());
        debug!(user_id, group_id, "setup session started");
        session
    }

    /// The user's session, if one exists and has not expired.
    pub fn get_valid(&self, user_id: UserId) -> Option<SetupSession> {
        let now = self.clock.now();
        self.sessions
            .get(&user_id)
            .filter(|session| session.expires_at > now)
            .map(|session| session.value().clone())
    }

    /// Move a live session to `stage`, applying `mutate` to its draft.
    /// Activity extends the expiry window.
    pub fn advance<F>(
        &self,
        user_id: UserId,
        stage: SetupStage,
        mutate: F,
    ) -> Result<SetupSession, SetupError>
    where
        F: FnOnce(&mut SetupDraft),
    {
        let now = self.clock.now();
        match self.sessions.get_mut(&user_id) {
            Some(mut session) if session.expires_at > now => {
                session.stage = stage;
                mutate(&mut session.draft);
                session.expires_at = now + self.ttl;
                Ok(session.value().clone())
            }
            _ => Err(SetupError::NoActiveSession(user_id)),
        }
    }

    /// Finish a live session, yielding its draft for persistence.
    pub fn complete(&self, user_id: UserId) -> Option<SetupDraft> {
        let now = self.clock.now();
        self.sessions
            .remove_if(&user_id, |_, session| session.expires_at > now)
            .map(|(_, session)| {
                debug!(user_id, "setup session completed");
                session.draft
            })
    }

    /// Abandon a session regardless of validity.
    pub fn cancel(&self, user_id: UserId) -> bool {
        self.sessions.remove(&user_id).is_some()
    }

    /// Remove every expired session. Returns the count removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!(removed, "swept expired setup sessions");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .iter()
            .filter(|session| session.expires_at > now)
            .count()
    }

    /// Run `sweep_expired` on a fixed interval until aborted.
    pub fn spawn_sweep_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_expired();
            }
        })
    }
}
