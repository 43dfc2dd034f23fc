pub mod collaborators;
pub mod pipeline;
pub mod setup_sessions;
pub mod types;

#[cfg(test)]
mod tests;

pub use collaborators::{
    ChatTransport, Classifier, CodeHostClient, Collaborators, DeliverOptions, DeliveryAck,
    GroupConfigStore, OperationStore, StorageFailure,
};
pub use pipeline::MessageProcessor;
pub use setup_sessions::{
    SetupDraft, SetupError, SetupSession, SetupSessionStore, SetupStage, UserId,
};
pub use types::{
    Classification, ClassifiedEntities, ExecutionOutcome, GroupConfig, InboundMessage, Intent,
    NewOperationRecord, OperationOutcome, OperationParams, OperationStatus, OperationType,
    ProcessingReport, ProcessorError, SkipReason,
};
