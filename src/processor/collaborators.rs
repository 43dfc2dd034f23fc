//! Narrow interfaces to the relay's external collaborators.
//!
//! The processor consumes these seams; implementations (the bot framework,
//! the LLM prompt/parsing layer, the code-host API client, the relational
//! store) live in the embedding binary.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{ChatMessageId, ContextMessage, GroupId};
use crate::limiter::ProviderFailure;
use crate::processor::types::{
    Classification, GroupConfig, NewOperationRecord, OperationOutcome, OperationParams,
    OperationType,
};

/// Failure from the relational store behind the repositories.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StorageFailure(pub String);

/// Options for one outbound chat delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliverOptions {
    pub reply_to_message_id: Option<ChatMessageId>,
    pub silent: bool,
}

/// Acknowledgement returned by the chat platform.
#[derive(Debug, Clone)]
pub struct DeliveryAck {
    pub message_id: ChatMessageId,
}

/// Outbound side of the chat platform. Invoked only for final
/// notifications, always through the chat limiter.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn deliver(
        &self,
        group_id: GroupId,
        text: &str,
        opts: DeliverOptions,
    ) -> Result<DeliveryAck, ProviderFailure>;
}

/// Language-model classification of a chat message.
///
/// Must never fail for business reasons: input it cannot map to an
/// operation yields [`Classification::unknown`]. Errors are infrastructure
/// only (network, auth, provider faults).
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        context: Option<&[ContextMessage]>,
    ) -> Result<Classification, ProviderFailure>;
}

/// Opaque executor for code-host operations.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    async fn execute(
        &self,
        operation: OperationType,
        params: OperationParams,
    ) -> Result<OperationOutcome, ProviderFailure>;
}

/// Repository of per-group configuration.
#[async_trait]
pub trait GroupConfigStore: Send + Sync {
    async fn get(&self, group_id: GroupId) -> Result<Option<GroupConfig>, StorageFailure>;
}

/// Append-only log of attempted operations.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, record: NewOperationRecord) -> Result<Uuid, StorageFailure>;
}

/// Bundle of the collaborators a [`MessageProcessor`](crate::processor::MessageProcessor) composes.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn ChatTransport>,
    pub classifier: Arc<dyn Classifier>,
    pub code_host: Arc<dyn CodeHostClient>,
    pub group_configs: Arc<dyn GroupConfigStore>,
    pub operations: Arc<dyn OperationStore>,
}
