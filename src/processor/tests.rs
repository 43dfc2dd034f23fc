use super::*;
use crate::clock::ManualClock;
use crate::config::RelayConfig;
use crate::context::{CacheContextRequest, ContextMessage, GroupId};
use crate::limiter::ProviderFailure;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

const GROUP: GroupId = -1001;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
}

#[derive(Default)]
struct RecordingTransport {
    deliveries: StdMutex<Vec<(GroupId, String, Option<i64>)>>,
    fail: bool,
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn deliver(
        &self,
        group_id: GroupId,
        text: &str,
        opts: DeliverOptions,
    ) -> Result<DeliveryAck, ProviderFailure> {
        if self.fail {
            return Err(ProviderFailure::new("bad gateway").with_status(502));
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((group_id, text.to_string(), opts.reply_to_message_id));
        Ok(DeliveryAck { message_id: 9_999 })
    }
}

struct ScriptedClassifier {
    result: Result<Classification, ProviderFailure>,
    calls: StdMutex<Vec<(String, Option<usize>)>>,
}

impl ScriptedClassifier {
    fn returning(classification: Classification) -> Self {
        Self {
            result: Ok(classification),
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn failing(failure: ProviderFailure) -> Self {
        Self {
            result: Err(failure),
            calls: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        text: &str,
        context: Option<&[ContextMessage]>,
    ) -> Result<Classification, ProviderFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), context.map(|c| c.len())));
        self.result.clone()
    }
}

struct RecordingCodeHost {
    calls: StdMutex<Vec<(OperationType, OperationParams)>>,
    failures_left: AtomicU32,
}

impl RecordingCodeHost {
    fn new(failures_left: u32) -> Self {
        Self {
            calls: StdMutex::new(Vec::new()),
            failures_left: AtomicU32::new(failures_left),
        }
    }
}

#[async_trait]
impl CodeHostClient for RecordingCodeHost {
    async fn execute(
        &self,
        operation: OperationType,
        params: OperationParams,
    ) -> Result<OperationOutcome, ProviderFailure> {
        self.calls.lock().unwrap().push((operation, params));
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderFailure::new("service unavailable").with_status(503));
        }
        Ok(OperationOutcome {
            identifier: "#42".to_string(),
            url: "https://host.example/acme/widgets/issues/42".to_string(),
        })
    }
}

struct StaticConfigStore {
    configs: HashMap<GroupId, GroupConfig>,
    fail: bool,
}

#[async_trait]
impl GroupConfigStore for StaticConfigStore {
    async fn get(&self, group_id: GroupId) -> Result<Option<GroupConfig>, StorageFailure> {
        if self.fail {
            return Err(StorageFailure("config database unreachable".to_string()));
        }
        Ok(self.configs.get(&group_id).cloned())
    }
}

#[derive(Default)]
struct RecordingOperationStore {
    records: StdMutex<Vec<NewOperationRecord>>,
    fail: bool,
}

#[async_trait]
impl OperationStore for RecordingOperationStore {
    async fn create(&self, record: NewOperationRecord) -> Result<Uuid, StorageFailure> {
        if self.fail {
            return Err(StorageFailure("operations table locked".to_string()));
        }
        self.records.lock().unwrap().push(record);
        Ok(Uuid::new_v4())
    }
}

struct Harness {
    processor: MessageProcessor,
    transport: Arc<RecordingTransport>,
    classifier: Arc<ScriptedClassifier>,
    code_host: Arc<RecordingCodeHost>,
    operations: Arc<RecordingOperationStore>,
    clock: Arc<ManualClock>,
}

#[derive(Default)]
struct HarnessOptions {
    no_group_config: bool,
    group_min_confidence: Option<f32>,
    config_store_fails: bool,
    transport_fails: bool,
    operations_fail: bool,
    code_host_failures: u32,
}

fn harness(classifier: ScriptedClassifier, options: HarnessOptions) -> Harness {
    let clock = Arc::new(ManualClock::new(epoch()));
    let transport = Arc::new(RecordingTransport {
        fail: options.transport_fails,
        ..RecordingTransport::default()
    });
    let classifier = Arc::new(classifier);
    let code_host = Arc::new(RecordingCodeHost::new(options.code_host_failures));
    let operations = Arc::new(RecordingOperationStore {
        fail: options.operations_fail,
        ..RecordingOperationStore::default()
    });

    let mut configs = HashMap::new();
    if !options.no_group_config {
        configs.insert(
            GROUP,
            GroupConfig {
                group_id: GROUP,
                repository: "acme/widgets".to_string(),
                min_confidence: options.group_min_confidence,
                context_ttl_minutes: 60,
            },
        );
    }
    let group_configs = Arc::new(StaticConfigStore {
        configs,
        fail: options.config_store_fails,
    });

    let collaborators = Collaborators {
        transport: transport.clone(),
        classifier: classifier.clone(),
        code_host: code_host.clone(),
        group_configs,
        operations: operations.clone(),
    };
    let processor =
        MessageProcessor::with_clock(RelayConfig::default(), collaborators, clock.clone());
    Harness {
        processor,
        transport,
        classifier,
        code_host,
        operations,
        clock,
    }
}

fn classification(intent: Intent, confidence: f32) -> Classification {
    Classification {
        intent,
        confidence,
        entities: ClassifiedEntities {
            title: Some("Crash when saving a draft".to_string()),
            body: Some("Steps: open editor, hit save twice.".to_string()),
            issue_number: Some(41),
            labels: vec!["bug".to_string()],
        },
        reasoning: Some("user reports a defect".to_string()),
    }
}

fn inbound(text: &str) -> InboundMessage {
    InboundMessage {
        message_id: 555,
        group_id: GROUP,
        sender: "alice".to_string(),
        text: text.to_string(),
        reply_to_message_id: None,
        received_at: epoch(),
    }
}

#[tokio::test(start_paused = true)]
async fn actionable_message_executes_stores_and_notifies() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.92)),
        HarnessOptions::default(),
    );

    let report = h
        .processor
        .process(inbound("the editor crashes when I save twice"))
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        ExecutionOutcome::Executed {
            identifier: "#42".to_string(),
            url: "https://host.example/acme/widgets/issues/42".to_string(),
        }
    );
    assert!(report.stored);
    assert!(report.notified);

    let calls = h.code_host.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, OperationType::CreateIssue);
    assert_eq!(calls[0].1.repository, "acme/widgets");
    assert_eq!(calls[0].1.title.as_deref(), Some("Crash when saving a draft"));

    let records = h.operations.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OperationStatus::Completed);
    assert_eq!(records[0].identifier.as_deref(), Some("#42"));
    assert_eq!(records[0].requested_by, "alice");
    assert_eq!(records[0].created_at, epoch());

    let deliveries = h.transport.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].1.contains("#42"));
    assert_eq!(deliveries[0].2, Some(555), "reply should thread to the message");
}

#[tokio::test(start_paused = true)]
async fn unknown_intent_skips_execution_but_records_and_notifies() {
    let h = harness(
        ScriptedClassifier::returning(Classification::unknown()),
        HarnessOptions::default(),
    );

    let report = h.processor.process(inbound("lol what a week")).await.unwrap();

    assert_eq!(
        report.outcome,
        ExecutionOutcome::Skipped {
            reason: SkipReason::UnknownIntent
        }
    );
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 0);

    let records = h.operations.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OperationStatus::Skipped);
    assert_eq!(records[0].intent, Intent::Unknown);
    assert_eq!(records[0].confidence, 0.0);

    assert_eq!(h.transport.deliveries.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sub_threshold_confidence_skips_execution() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.4)),
        HarnessOptions::default(),
    );

    let report = h.processor.process(inbound("maybe broken?")).await.unwrap();

    assert_eq!(
        report.outcome,
        ExecutionOutcome::Skipped {
            reason: SkipReason::LowConfidence {
                confidence: 0.4,
                threshold: 0.7,
            }
        }
    );
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 0);
    assert_eq!(
        h.operations.records.lock().unwrap()[0].status,
        OperationStatus::Skipped
    );
}

#[tokio::test(start_paused = true)]
async fn group_threshold_override_applies() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.4)),
        HarnessOptions {
            group_min_confidence: Some(0.3),
            ..HarnessOptions::default()
        },
    );

    let report = h.processor.process(inbound("file it anyway")).await.unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Executed { .. }));
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_group_config_fails_before_any_collaborator_interaction() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.9)),
        HarnessOptions {
            no_group_config: true,
            ..HarnessOptions::default()
        },
    );

    let err = h.processor.process(inbound("new issue please")).await.unwrap_err();
    assert!(matches!(&err, ProcessorError::ConfigMissing { group_id } if *group_id == GROUP));
    assert!(err.user_message().contains("setup"));

    assert_eq!(h.classifier.calls.lock().unwrap().len(), 0);
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 0);
    assert_eq!(h.transport.deliveries.lock().unwrap().len(), 0);
    assert_eq!(h.operations.records.lock().unwrap().len(), 0);
    let counts = h.processor.model_limiter().counts();
    assert_eq!(counts.completed, 0, "no limiter interaction may have happened");
}

#[tokio::test(start_paused = true)]
async fn config_store_failure_is_critical() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.9)),
        HarnessOptions {
            config_store_fails: true,
            ..HarnessOptions::default()
        },
    );

    let err = h.processor.process(inbound("anything")).await.unwrap_err();
    assert!(matches!(err, ProcessorError::ConfigLookup(_)));
    assert_eq!(h.classifier.calls.lock().unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn classifier_infrastructure_failure_is_critical() {
    let h = harness(
        ScriptedClassifier::failing(ProviderFailure::new("invalid api key").with_status(401)),
        HarnessOptions::default(),
    );

    let err = h.processor.process(inbound("close #41")).await.unwrap_err();
    assert!(matches!(err, ProcessorError::Classification(_)));
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 0);
    assert_eq!(h.operations.records.lock().unwrap().len(), 0);
    assert_eq!(h.transport.deliveries.lock().unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_never_blocks_notification() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CloseIssue, 0.95)),
        HarnessOptions {
            operations_fail: true,
            ..HarnessOptions::default()
        },
    );

    let report = h.processor.process(inbound("close #41, fixed")).await.unwrap();

    assert!(matches!(report.outcome, ExecutionOutcome::Executed { .. }));
    assert!(!report.stored);
    assert!(report.storage_error.is_some());
    assert!(report.notified, "notification must still go out");
    assert_eq!(h.transport.deliveries.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn notification_failure_degrades_without_error() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.9)),
        HarnessOptions {
            transport_fails: true,
            ..HarnessOptions::default()
        },
    );

    let report = h.processor.process(inbound("file this")).await.unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Executed { .. }));
    assert!(report.stored);
    assert!(!report.notified);
}

#[tokio::test(start_paused = true)]
async fn reply_messages_carry_cached_thread_context() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CommentOnIssue, 0.9)),
        HarnessOptions::default(),
    );

    h.processor
        .cache()
        .cache_context(CacheContextRequest {
            group_id: GROUP,
            thread_root_message_id: 500,
            messages: vec![
                ContextMessage {
                    message_id: 500,
                    sender: "bob".to_string(),
                    text: "editor crashes on save".to_string(),
                    sent_at: epoch(),
                },
                ContextMessage {
                    message_id: 501,
                    sender: "alice".to_string(),
                    text: "same here".to_string(),
                    sent_at: epoch(),
                },
            ],
            ttl_minutes: 60,
        })
        .unwrap();

    let mut message = inbound("add that it happens on autosave too");
    message.reply_to_message_id = Some(500);
    h.processor.process(message).await.unwrap();

    let calls = h.classifier.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, Some(2), "classifier should see both thread messages");
}

#[tokio::test(start_paused = true)]
async fn expired_thread_context_is_not_used() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CommentOnIssue, 0.9)),
        HarnessOptions::default(),
    );

    h.processor
        .cache()
        .cache_context(CacheContextRequest {
            group_id: GROUP,
            thread_root_message_id: 500,
            messages: vec![ContextMessage {
                message_id: 500,
                sender: "bob".to_string(),
                text: "old thread".to_string(),
                sent_at: epoch(),
            }],
            ttl_minutes: 1,
        })
        .unwrap();
    h.clock.advance(ChronoDuration::minutes(2));

    let mut message = inbound("still happening");
    message.reply_to_message_id = Some(500);
    h.processor.process(message).await.unwrap();

    assert_eq!(h.classifier.calls.lock().unwrap()[0].1, None);
}

#[tokio::test(start_paused = true)]
async fn reply_without_cached_context_proceeds_without_it() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CommentOnIssue, 0.9)),
        HarnessOptions::default(),
    );

    let mut message = inbound("following up on this");
    message.reply_to_message_id = Some(12_345);
    let report = h.processor.process(message).await.unwrap();

    assert!(matches!(report.outcome, ExecutionOutcome::Executed { .. }));
    assert_eq!(h.classifier.calls.lock().unwrap()[0].1, None);
}

#[tokio::test(start_paused = true)]
async fn transient_code_host_failure_is_retried_invisibly() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.9)),
        HarnessOptions {
            code_host_failures: 1,
            ..HarnessOptions::default()
        },
    );

    let report = h.processor.process(inbound("file the crash")).await.unwrap();

    assert!(matches!(report.outcome, ExecutionOutcome::Executed { .. }));
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 2);
    let records = h.operations.records.lock().unwrap();
    assert_eq!(records.len(), 1, "one record per end-to-end action, not per attempt");
    assert_eq!(records[0].status, OperationStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn limiter_and_queue_retry_layers_compose_before_permanent_failure() {
    let h = harness(
        ScriptedClassifier::returning(classification(Intent::CreateIssue, 0.9)),
        HarnessOptions {
            code_host_failures: u32::MAX,
            ..HarnessOptions::default()
        },
    );

    let report = h.processor.process(inbound("file the crash")).await.unwrap();

    match &report.outcome {
        ExecutionOutcome::Failed { error } => {
            assert!(error.contains("failed permanently"));
        }
        other => panic!("expected Failed outcome, got {other:?}"),
    }
    // Each of the queue's 4 attempts exhausts the limiter's 4 provider
    // attempts: the two retry layers are bounded independently.
    assert_eq!(h.code_host.calls.lock().unwrap().len(), 16);
    let records = h.operations.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OperationStatus::Failed);
    assert!(report.notified, "user hears about exhausted retries");
}

#[test]
fn setup_sessions_advance_and_complete() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SetupSessionStore::new(15, clock.clone());

    let session = store.begin(77, GROUP);
    assert_eq!(session.stage, SetupStage::AwaitingRepository);
    assert_eq!(store.active_count(), 1);

    store
        .advance(77, SetupStage::AwaitingPreferences, |draft| {
            draft.repository = Some("acme/widgets".to_string());
        })
        .unwrap();
    let session = store.get_valid(77).unwrap();
    assert_eq!(session.stage, SetupStage::AwaitingPreferences);
    assert_eq!(session.draft.repository.as_deref(), Some("acme/widgets"));

    let draft = store.complete(77).unwrap();
    assert_eq!(draft.repository.as_deref(), Some("acme/widgets"));
    assert!(store.get_valid(77).is_none());
}

#[test]
fn setup_sessions_expire_and_sweep() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SetupSessionStore::new(15, clock.clone());

    store.begin(77, GROUP);
    clock.advance(ChronoDuration::minutes(16));

    assert!(store.get_valid(77).is_none());
    assert!(matches!(
        store.advance(77, SetupStage::Confirming, |_| {}),
        Err(SetupError::NoActiveSession(77))
    ));
    assert!(store.complete(77).is_none());
    assert_eq!(store.sweep_expired(), 1);
    assert_eq!(store.active_count(), 0);
}

#[test]
fn setup_activity_extends_expiry() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SetupSessionStore::new(15, clock.clone());

    store.begin(77, GROUP);
    clock.advance(ChronoDuration::minutes(10));
    store
        .advance(77, SetupStage::AwaitingPreferences, |_| {})
        .unwrap();
    clock.advance(ChronoDuration::minutes(10));

    // 20 minutes after begin, but only 10 after the last activity.
    assert!(store.get_valid(77).is_some());
}
