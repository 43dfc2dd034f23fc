use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{ChatMessageId, GroupId};
use crate::limiter::LimiterError;
use crate::processor::collaborators::StorageFailure;

/// Intent recognized in a chat message by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    CreateIssue,
    CommentOnIssue,
    CloseIssue,
    ReopenIssue,
    /// The classifier could not map the message to an operation.
    Unknown,
    /// The message is conversation noise the bot should leave alone.
    Ignore,
}

impl Intent {
    /// The code-host operation this intent maps to, if any.
    pub fn operation(&self) -> Option<OperationType> {
        match self {
            Intent::CreateIssue => Some(OperationType::CreateIssue),
            Intent::CommentOnIssue => Some(OperationType::CommentOnIssue),
            Intent::CloseIssue => Some(OperationType::CloseIssue),
            Intent::ReopenIssue => Some(OperationType::ReopenIssue),
            Intent::Unknown | Intent::Ignore => None,
        }
    }
}

/// Operation executed against the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    CreateIssue,
    CommentOnIssue,
    CloseIssue,
    ReopenIssue,
}

impl OperationType {
    /// Dispatch priority; lower dispatches first. State transitions on
    /// existing issues beat new content, comments come last.
    pub fn priority(&self) -> i64 {
        match self {
            OperationType::CloseIssue | OperationType::ReopenIssue => 10,
            OperationType::CreateIssue => 20,
            OperationType::CommentOnIssue => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateIssue => "create-issue",
            OperationType::CommentOnIssue => "comment-on-issue",
            OperationType::CloseIssue => "close-issue",
            OperationType::ReopenIssue => "reopen-issue",
        }
    }
}

/// Entities the classifier extracted from the message text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEntities {
    pub title: Option<String>,
    pub body: Option<String>,
    pub issue_number: Option<u64>,
    pub labels: Vec<String>,
}

/// Classification record returned by the language-model collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
    pub entities: ClassifiedEntities,
    pub reasoning: Option<String>,
}

impl Classification {
    /// The record a classifier returns when it cannot make sense of the
    /// input. Low confidence is a business outcome, never an error.
    pub fn unknown() -> Self {
        Self {
            intent: Intent::Unknown,
            confidence: 0.0,
            entities: ClassifiedEntities::default(),
            reasoning: None,
        }
    }
}

/// Parameters handed to the code-host client alongside the operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
    /// `owner/name` of the linked repository.
    pub repository: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub issue_number: Option<u64>,
    pub labels: Vec<String>,
}

/// Result of a successful code-host operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    /// Host-side identifier, e.g. an issue number like `#42`.
    pub identifier: String,
    pub url: String,
}

/// Per-group configuration linking a chat group to a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: GroupId,
    /// `owner/name` of the repository operations are relayed to.
    pub repository: String,
    /// Override of the global confidence threshold.
    pub min_confidence: Option<f32>,
    /// TTL applied when the bot caches thread context for this group.
    pub context_ttl_minutes: i64,
}

/// Inbound chat message handed to the processor.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: ChatMessageId,
    pub group_id: GroupId,
    pub sender: String,
    pub text: String,
    /// Root of the thread this message replies to, when it is a reply.
    pub reply_to_message_id: Option<ChatMessageId>,
    pub received_at: DateTime<Utc>,
}

/// Why the execution stage was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    UnknownIntent,
    IgnoredIntent,
    LowConfidence { confidence: f32, threshold: f32 },
}

/// Terminal state of the execution stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Executed { identifier: String, url: String },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> OperationStatus {
        match self {
            ExecutionOutcome::Executed { .. } => OperationStatus::Completed,
            ExecutionOutcome::Skipped { .. } => OperationStatus::Skipped,
            ExecutionOutcome::Failed { .. } => OperationStatus::Failed,
        }
    }
}

/// Outcome column of the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Completed,
    Skipped,
    Failed,
}

/// Row data for the operation log. One record is written per attempted
/// end-to-end action regardless of outcome; the store owns the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOperationRecord {
    pub message_id: ChatMessageId,
    pub group_id: GroupId,
    pub requested_by: String,
    pub intent: Intent,
    pub confidence: f32,
    pub status: OperationStatus,
    pub operation: Option<OperationType>,
    pub identifier: Option<String>,
    pub url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal report for one processed message.
#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub message_id: ChatMessageId,
    pub group_id: GroupId,
    pub intent: Intent,
    pub confidence: f32,
    pub outcome: ExecutionOutcome,
    pub stored: bool,
    /// Present when the operation log write failed; never aborts the flow.
    pub storage_error: Option<String>,
    pub notified: bool,
}

/// Critical failures that abort processing before any user-visible effect.
///
/// Everything past classification degrades instead of erroring; these are
/// the only ways `process` returns `Err`.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("no configuration for group {group_id}")]
    ConfigMissing { group_id: GroupId },
    #[error("group configuration lookup failed: {0}")]
    ConfigLookup(#[from] StorageFailure),
    #[error("classification failed: {0}")]
    Classification(LimiterError),
}

impl ProcessorError {
    /// Remediation text for the embedding bot layer to deliver. The
    /// processor itself does not notify for these failures: a message that
    /// never resolved its group config must not touch any limiter.
    pub fn user_message(&self) -> String {
        match self {
            ProcessorError::ConfigMissing { .. } => {
                "This group isn't linked to a repository yet. Ask an administrator \
                 to run setup before relaying messages."
                    .to_string()
            }
            ProcessorError::ConfigLookup(_) => {
                "Something went wrong looking up this group's configuration. \
                 Please try again in a moment."
                    .to_string()
            }
            ProcessorError::Classification(_) => {
                "I couldn't reach the language model to understand that message. \
                 Please try again in a moment."
                    .to_string()
            }
        }
    }
}
