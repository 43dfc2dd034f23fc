use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::context::{ContextMessage, ConversationContextCache};
use crate::limiter::RateLimiter;
use crate::processor::collaborators::{Collaborators, DeliverOptions};
use crate::processor::setup_sessions::SetupSessionStore;
use crate::processor::types::{
    Classification, ExecutionOutcome, GroupConfig, InboundMessage, Intent, NewOperationRecord,
    OperationOutcome, OperationParams, OperationType, ProcessingReport, ProcessorError,
    SkipReason,
};
use crate::queue::{AddOptions, JobFailure, PriorityJobQueue, StopMode};

/// Orchestrates one inbound message from receipt to notification.
///
/// Stages: config resolution, optional thread-context fetch, classification
/// (through the model limiter), execution (through the queue, itself gated
/// by the code-host limiter), operation logging, notification (through the
/// chat limiter). Infrastructure failures in the first two gated stages are
/// critical; everything after degrades — a partial record beats silence.
///
/// Must be constructed inside a tokio runtime: the dispatch queue starts
/// its dispatcher task immediately.
pub struct MessageProcessor {
    min_confidence: f32,
    context_sweep_interval: std::time::Duration,
    setup_session_sweep_interval: std::time::Duration,
    chat_limiter: Arc<RateLimiter>,
    code_host_limiter: Arc<RateLimiter>,
    model_limiter: Arc<RateLimiter>,
    queue: PriorityJobQueue<OperationOutcome>,
    cache: Arc<ConversationContextCache>,
    setup_sessions: Arc<SetupSessionStore>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
}

impl MessageProcessor {
    pub fn new(config: RelayConfig, collaborators: Collaborators) -> Self {
        Self::with_clock(config, collaborators, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RelayConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let chat_limiter = Arc::new(RateLimiter::new(config.chat_limiter.clone()));
        let code_host_limiter = Arc::new(RateLimiter::new(config.code_host_limiter.clone()));
        let model_limiter = Arc::new(RateLimiter::new(config.model_limiter.to_limiter_config()));
        let queue = PriorityJobQueue::new(config.queue.clone());
        let cache = Arc::new(ConversationContextCache::new(Arc::clone(&clock)));
        let setup_sessions = Arc::new(SetupSessionStore::new(
            config.setup_session_ttl_minutes,
            Arc::clone(&clock),
        ));
        Self {
            min_confidence: config.min_confidence,
            context_sweep_interval: config.context_sweep_interval,
            setup_session_sweep_interval: config.setup_session_sweep_interval,
            chat_limiter,
            code_host_limiter,
            model_limiter,
            queue,
            cache,
            setup_sessions,
            collaborators,
            clock,
        }
    }

    /// Run the full state machine for one message.
    ///
    /// Returns `Err` only for critical failures: a missing or unreachable
    /// group configuration, or an infrastructure failure during
    /// classification. In those cases no limiter has been touched for
    /// `ConfigMissing`, and the caller delivers
    /// [`ProcessorError::user_message`] however it sees fit.
    pub async fn process(
        &self,
        message: InboundMessage,
    ) -> Result<ProcessingReport, ProcessorError> {
        debug!(
            group_id = message.group_id,
            message_id = message.message_id,
            sender = %message.sender,
            "message received"
        );

        let group_config = self
            .collaborators
            .group_configs
            .get(message.group_id)
            .await?
            .ok_or(ProcessorError::ConfigMissing {
                group_id: message.group_id,
            })?;
        debug!(
            group_id = message.group_id,
            message_id = message.message_id,
            repository = %group_config.repository,
            "group config resolved"
        );

        let context = self.gather_context(&message);

        let classification = self.classify(&message, context).await?;
        info!(
            group_id = message.group_id,
            message_id = message.message_id,
            intent = ?classification.intent,
            confidence = classification.confidence,
            "message classified"
        );

        let outcome = self
            .execute(&message, &group_config, &classification)
            .await;

        let (stored, storage_error) = self.store(&message, &classification, &outcome).await;

        let notified = self.notify(&message, &classification, &outcome).await;

        Ok(ProcessingReport {
            message_id: message.message_id,
            group_id: message.group_id,
            intent: classification.intent,
            confidence: classification.confidence,
            outcome,
            stored,
            storage_error,
            notified,
        })
    }

    /// Graceful shutdown of the dispatch queue.
    pub async fn shutdown(&self, mode: StopMode) {
        self.queue.stop(mode).await;
    }

    /// Start the periodic expiry sweeps for the context cache and setup
    /// sessions. Abort the handles to stop them.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        vec![
            Arc::clone(&self.cache).spawn_sweep_task(self.context_sweep_interval),
            Arc::clone(&self.setup_sessions)
                .spawn_sweep_task(self.setup_session_sweep_interval),
        ]
    }

    pub fn cache(&self) -> &Arc<ConversationContextCache> {
        &self.cache
    }

    pub fn setup_sessions(&self) -> &Arc<SetupSessionStore> {
        &self.setup_sessions
    }

    pub fn queue(&self) -> &PriorityJobQueue<OperationOutcome> {
        &self.queue
    }

    pub fn chat_limiter(&self) -> &Arc<RateLimiter> {
        &self.chat_limiter
    }

    pub fn code_host_limiter(&self) -> &Arc<RateLimiter> {
        &self.code_host_limiter
    }

    pub fn model_limiter(&self) -> &Arc<RateLimiter> {
        &self.model_limiter
    }

    /// Thread context for reply messages. A miss is not an error: the
    /// workflow proceeds without context.
    fn gather_context(&self, message: &InboundMessage) -> Option<Vec<ContextMessage>> {
        let root = message.reply_to_message_id?;
        match self.cache.get_context(message.group_id, root) {
            Ok(entry) => {
                debug!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    thread_root = root,
                    messages = entry.messages.len(),
                    "thread context gathered"
                );
                Some(entry.messages)
            }
            Err(err) => {
                debug!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    thread_root = root,
                    reason = %err,
                    "no usable thread context; continuing without"
                );
                None
            }
        }
    }

    async fn classify(
        &self,
        message: &InboundMessage,
        context: Option<Vec<ContextMessage>>,
    ) -> Result<Classification, ProcessorError> {
        let classifier = Arc::clone(&self.collaborators.classifier);
        let text = message.text.clone();
        self.model_limiter
            .schedule("classify-message", move || {
                let classifier = Arc::clone(&classifier);
                let text = text.clone();
                let context = context.clone();
                async move { classifier.classify(&text, context.as_deref()).await }
            })
            .await
            .map_err(ProcessorError::Classification)
    }

    async fn execute(
        &self,
        message: &InboundMessage,
        group_config: &GroupConfig,
        classification: &Classification,
    ) -> ExecutionOutcome {
        let Some(operation) = classification.intent.operation() else {
            let reason = if classification.intent == Intent::Ignore {
                SkipReason::IgnoredIntent
            } else {
                SkipReason::UnknownIntent
            };
            debug!(
                group_id = message.group_id,
                message_id = message.message_id,
                ?reason,
                "execution skipped"
            );
            return ExecutionOutcome::Skipped { reason };
        };

        let threshold = group_config.min_confidence.unwrap_or(self.min_confidence);
        if classification.confidence < threshold {
            debug!(
                group_id = message.group_id,
                message_id = message.message_id,
                confidence = classification.confidence,
                threshold,
                "execution skipped below confidence threshold"
            );
            return ExecutionOutcome::Skipped {
                reason: SkipReason::LowConfidence {
                    confidence: classification.confidence,
                    threshold,
                },
            };
        }

        self.dispatch_operation(message, group_config, operation, classification)
            .await
    }

    async fn dispatch_operation(
        &self,
        message: &InboundMessage,
        group_config: &GroupConfig,
        operation: OperationType,
        classification: &Classification,
    ) -> ExecutionOutcome {
        let params = OperationParams {
            repository: group_config.repository.clone(),
            title: classification.entities.title.clone(),
            body: classification.entities.body.clone(),
            issue_number: classification.entities.issue_number,
            labels: classification.entities.labels.clone(),
        };
        let limiter = Arc::clone(&self.code_host_limiter);
        let code_host = Arc::clone(&self.collaborators.code_host);
        let label = operation.as_str();

        let job = move || {
            let limiter = Arc::clone(&limiter);
            let code_host = Arc::clone(&code_host);
            let params = params.clone();
            async move {
                limiter
                    .schedule(label, move || {
                        let code_host = Arc::clone(&code_host);
                        let params = params.clone();
                        async move { code_host.execute(operation, params).await }
                    })
                    .await
                    .map_err(JobFailure::from)
            }
        };

        let added = self
            .queue
            .add(
                job,
                AddOptions {
                    priority: operation.priority(),
                    id: Some(format!("msg-{}-{}", message.group_id, message.message_id)),
                    context: Some(serde_json::json!({
                        "group_id": message.group_id,
                        "message_id": message.message_id,
                        "operation": label,
                    })),
                },
            )
            .await;

        let outcome = match added {
            Ok(handle) => handle.outcome().await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(OperationOutcome { identifier, url }) => {
                info!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    operation = label,
                    identifier = %identifier,
                    "operation executed"
                );
                ExecutionOutcome::Executed { identifier, url }
            }
            Err(err) => {
                warn!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    operation = label,
                    error = %err,
                    "operation failed"
                );
                ExecutionOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Unconditional operation-log write. A storage failure is demoted to
    /// report state so notification still happens.
    async fn store(
        &self,
        message: &InboundMessage,
        classification: &Classification,
        outcome: &ExecutionOutcome,
    ) -> (bool, Option<String>) {
        let (identifier, url) = match outcome {
            ExecutionOutcome::Executed { identifier, url } => {
                (Some(identifier.clone()), Some(url.clone()))
            }
            _ => (None, None),
        };
        let error = match outcome {
            ExecutionOutcome::Failed { error } => Some(error.clone()),
            _ => None,
        };
        let record = NewOperationRecord {
            message_id: message.message_id,
            group_id: message.group_id,
            requested_by: message.sender.clone(),
            intent: classification.intent,
            confidence: classification.confidence,
            status: outcome.status(),
            operation: classification.intent.operation(),
            identifier,
            url,
            error,
            created_at: self.clock.now(),
        };
        match self.collaborators.operations.create(record).await {
            Ok(operation_id) => {
                debug!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    %operation_id,
                    "operation recorded"
                );
                (true, None)
            }
            Err(err) => {
                warn!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    error = %err,
                    "operation record write failed; continuing to notification"
                );
                (false, Some(err.to_string()))
            }
        }
    }

    async fn notify(
        &self,
        message: &InboundMessage,
        classification: &Classification,
        outcome: &ExecutionOutcome,
    ) -> bool {
        let text = outcome_reply(classification.intent, outcome);
        let transport = Arc::clone(&self.collaborators.transport);
        let group_id = message.group_id;
        let reply_to = message.message_id;
        let delivery = self
            .chat_limiter
            .schedule("notify-outcome", move || {
                let transport = Arc::clone(&transport);
                let text = text.clone();
                async move {
                    transport
                        .deliver(
                            group_id,
                            &text,
                            DeliverOptions {
                                reply_to_message_id: Some(reply_to),
                                silent: false,
                            },
                        )
                        .await
                }
            })
            .await;
        match delivery {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    group_id = message.group_id,
                    message_id = message.message_id,
                    error = %err,
                    "outcome notification failed"
                );
                false
            }
        }
    }
}

/// User-facing reply for a terminal outcome. Infrastructure detail stays in
/// the logs; the user gets what happened and, on skip, why.
fn outcome_reply(intent: Intent, outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Executed { identifier, url } => match intent {
            Intent::CreateIssue => format!("Created issue {identifier}: {url}"),
            Intent::CommentOnIssue => format!("Added a comment to {identifier}: {url}"),
            Intent::CloseIssue => format!("Closed {identifier}: {url}"),
            Intent::ReopenIssue => format!("Reopened {identifier}: {url}"),
            Intent::Unknown | Intent::Ignore => format!("Done: {identifier} ({url})"),
        },
        ExecutionOutcome::Skipped {
            reason: SkipReason::UnknownIntent,
        } => "I couldn't map that message to a tracked operation, so nothing was filed."
            .to_string(),
        ExecutionOutcome::Skipped {
            reason: SkipReason::IgnoredIntent,
        } => "Noted. No action needed for that one.".to_string(),
        ExecutionOutcome::Skipped {
            reason:
                SkipReason::LowConfidence {
                    confidence,
                    threshold,
                },
        } => format!(
            "I wasn't confident enough to act on that (confidence {confidence:.2}, \
             needs {threshold:.2}), so nothing was filed."
        ),
        ExecutionOutcome::Failed { .. } => {
            "Something went wrong while executing that request. The failure has been \
             logged for review."
                .to_string()
        }
    }
}
