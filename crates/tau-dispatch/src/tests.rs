//! Dispatcher flows driven through a scripted agent engine.
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tau_context::{
    estimate_messages_tokens, estimate_text_tokens, ContextBudgetConfig, MemoryFlushSettings,
    SILENT_REPLY_TOKEN,
};
use tau_provider::{
    load_auth_profile_store, save_auth_profile_store, AuthCredential, AuthFailureReason,
    AuthProfileResolver, AuthProfileStore,
};
use tau_sandbox::{SandboxConfig, SandboxMode, SandboxSettings};
use tau_session::{
    JournalMessage, JournalRecord, MessageRole, RunStatus, SessionIndexStore, SessionJournalStore,
};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

use super::{
    AgentEngine, AgentEngineError, AgentInvocation, AgentTurnResult, DeliveryReceipt,
    DispatchEvent, DispatcherConfig, DispatcherDependencies, DropPolicy, EnqueueOutcome, InboundDispatcher,
    InvocationKind, OutboundReply, QueueMode, QueueSettings, QueueSettingsOverride, ReplySink,
};

const NOW: u64 = 1_700_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

type ScriptedReply = Result<AgentTurnResult, AgentEngineError>;

#[derive(Debug, Clone)]
struct StartedInvocation {
    kind: InvocationKind,
    prompt: String,
    history: Vec<JournalMessage>,
    profile_id: String,
    sandbox_enabled: bool,
}

/// Records every invocation; gated engines then wait for a scripted reply
/// or cancellation, others answer immediately.
struct ScriptedEngine {
    gated: bool,
    live_input: bool,
    started: mpsc::UnboundedSender<StartedInvocation>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedReply>>,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    fn supports_live_input(&self) -> bool {
        self.live_input
    }

    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentTurnResult, AgentEngineError> {
        let _ = self.started.send(StartedInvocation {
            kind: invocation.kind,
            prompt: invocation.prompt.clone(),
            history: invocation.history.clone(),
            profile_id: invocation.credential.profile_id.clone(),
            sandbox_enabled: invocation.sandbox.enabled,
        });
        if !self.gated || invocation.kind != InvocationKind::UserTurn {
            return Ok(match invocation.kind {
                InvocationKind::UserTurn => {
                    AgentTurnResult::text(format!("echo: {}", invocation.prompt))
                }
                InvocationKind::MemoryFlush => AgentTurnResult::text(SILENT_REPLY_TOKEN),
                InvocationKind::CacheKeepalive => AgentTurnResult::text("ok"),
            });
        }

        let mut live_input = invocation.live_input;
        let mut steered = Vec::new();
        let mut replies = self.replies.lock().await;
        loop {
            tokio::select! {
                _ = invocation.cancel.cancelled() => return Err(AgentEngineError::Cancelled),
                reply = replies.recv() => {
                    if let Some(receiver) = live_input.as_mut() {
                        while let Ok(text) = receiver.try_recv() {
                            steered.push(text);
                        }
                    }
                    return match reply {
                        Some(Ok(mut result)) => {
                            result.steered_inputs = steered;
                            Ok(result)
                        }
                        Some(Err(error)) => Err(error),
                        None => Err(AgentEngineError::Cancelled),
                    };
                }
                Some(text) = recv_live(&mut live_input) => steered.push(text),
            }
        }
    }
}

async fn recv_live(receiver: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[derive(Default)]
struct CollectingReplySink {
    delivered: Mutex<Vec<OutboundReply>>,
}

#[async_trait]
impl ReplySink for CollectingReplySink {
    async fn deliver(&self, reply: &OutboundReply) -> anyhow::Result<DeliveryReceipt> {
        let mut delivered = self.delivered.lock().expect("delivered lock");
        delivered.push(reply.clone());
        Ok(DeliveryReceipt {
            message_ids: vec![format!("out-{}", delivered.len())],
        })
    }
}

struct Harness {
    _temp: TempDir,
    dispatcher: InboundDispatcher,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    started: mpsc::UnboundedReceiver<StartedInvocation>,
    replies: mpsc::UnboundedSender<ScriptedReply>,
    journal: SessionJournalStore,
    index: SessionIndexStore,
    auth_path: PathBuf,
    sink: Arc<CollectingReplySink>,
    clock: Arc<AtomicU64>,
}

struct HarnessOptions {
    config: DispatcherConfig,
    gated: bool,
    live_input: bool,
    profiles: Vec<(&'static str, AuthCredential)>,
}

impl HarnessOptions {
    fn new(mode: QueueMode) -> Self {
        let mut config = DispatcherConfig {
            default_provider: "openai".to_string(),
            default_model: "gpt-4o".to_string(),
            ..DispatcherConfig::default()
        };
        config.queue.defaults = QueueSettings {
            mode,
            debounce_ms: 0,
            ..QueueSettings::default()
        };
        Self {
            config,
            gated: true,
            live_input: false,
            profiles: vec![("openai:default", api_key("openai", "sk-default"))],
        }
    }

    fn auto(mut self) -> Self {
        self.gated = false;
        self
    }
}

fn api_key(provider: &str, key: &str) -> AuthCredential {
    AuthCredential::ApiKey {
        provider: provider.to_string(),
        key: key.to_string(),
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let temp = tempdir().expect("tempdir");
    let auth_path = temp.path().join("auth-profiles.json");
    let mut store = AuthProfileStore::default();
    for (id, credential) in options.profiles {
        store.profiles.insert(id.to_string(), credential);
    }
    save_auth_profile_store(&auth_path, &store).expect("save auth store");

    let clock = Arc::new(AtomicU64::new(NOW));
    let clock_fn: tau_core::ClockFn = {
        let clock = Arc::clone(&clock);
        Arc::new(move || clock.load(Ordering::SeqCst))
    };
    let journal = SessionJournalStore::new(temp.path().join("sessions")).with_clock(clock_fn.clone());
    let index = SessionIndexStore::new(temp.path().join("sessions.json")).with_clock(clock_fn.clone());

    let (started_tx, started) = mpsc::unbounded_channel();
    let (replies, replies_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ScriptedEngine {
        gated: options.gated,
        live_input: options.live_input,
        started: started_tx,
        replies: tokio::sync::Mutex::new(replies_rx),
    });
    let (events_tx, events) = mpsc::unbounded_channel();
    let sink = Arc::new(CollectingReplySink::default());
    let dependencies = DispatcherDependencies::new(
        engine,
        AuthProfileResolver::new(&auth_path),
        journal.clone(),
        index.clone(),
    )
    .with_reply_sink(sink.clone())
    .with_event_sink(Arc::new(move |event: &DispatchEvent| {
        let _ = events_tx.send(event.clone());
    }))
    .with_clock(clock_fn);

    Harness {
        _temp: temp,
        dispatcher: InboundDispatcher::new(options.config, dependencies),
        events,
        started,
        replies,
        journal,
        index,
        auth_path,
        sink,
        clock,
    }
}

impl Harness {
    fn key(&self) -> String {
        self.dispatcher.resolve_session_key("telegram", "bot", "alice")
    }

    fn enqueue(&self, sender: &str, message_id: &str, content: &str) -> EnqueueOutcome {
        self.dispatcher
            .enqueue(&self.key(), sender, message_id, content, NOW)
    }

    async fn next_started(&mut self) -> StartedInvocation {
        tokio::time::timeout(WAIT, self.started.recv())
            .await
            .expect("timed out waiting for engine invocation")
            .expect("engine channel open")
    }

    async fn wait_for(&mut self, predicate: impl Fn(&DispatchEvent) -> bool) -> DispatchEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for dispatch event")
    }

    async fn wait_completed(&mut self) -> DispatchEvent {
        self.wait_for(|event| matches!(event, DispatchEvent::RunCompleted { .. }))
            .await
    }

    fn reply(&self, text: &str) {
        self.replies
            .send(Ok(AgentTurnResult::text(text)))
            .expect("send reply");
    }

    async fn assert_no_further_invocation(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(150), self.started.recv()).await;
        assert!(next.is_err(), "unexpected engine invocation: {next:?}");
    }

    fn message_records(&self) -> Vec<(MessageRole, String)> {
        self.journal
            .read_entries(&self.key())
            .expect("read journal")
            .records
            .into_iter()
            .filter_map(|record| match record {
                JournalRecord::Message(message) => Some((
                    message.message.role,
                    message.message.text_content(),
                )),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn functional_duplicate_message_id_reaches_state_machine_once() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup).auto());

    assert_eq!(harness.enqueue("alice", "m1", "hello"), EnqueueOutcome::Accepted);
    assert_eq!(harness.enqueue("alice", "m1", "hello"), EnqueueOutcome::Duplicate);

    let started = harness.next_started().await;
    assert_eq!(started.prompt, "hello");
    harness.wait_completed().await;
    harness.assert_no_further_invocation().await;
    assert_eq!(
        harness.message_records(),
        vec![
            (MessageRole::User, "hello".to_string()),
            (MessageRole::Assistant, "echo: hello".to_string()),
        ]
    );
}

#[tokio::test]
async fn functional_prompt_dedupe_ignores_message_ids() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.queue.defaults.dedupe_mode = super::DedupeMode::Prompt;
    let harness = harness(options);

    assert_eq!(harness.enqueue("alice", "m1", "ping"), EnqueueOutcome::Accepted);
    assert_eq!(harness.enqueue("alice", "m2", " ping "), EnqueueOutcome::Duplicate);
    assert_eq!(harness.enqueue("bob", "m3", "ping"), EnqueueOutcome::Accepted);
}

#[tokio::test]
async fn functional_debounce_coalesces_sender_burst_in_arrival_order() {
    let mut options = HarnessOptions::new(QueueMode::Collect).auto();
    options.config.queue.defaults.debounce_ms = 60;
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "one");
    harness.enqueue("alice", "m2", "two");
    harness.enqueue("alice", "m3", "three");

    let event = harness
        .wait_for(|event| matches!(event, DispatchEvent::Debounced { .. }))
        .await;
    assert!(matches!(event, DispatchEvent::Debounced { merged: 3, .. }));
    let started = harness.next_started().await;
    assert_eq!(started.prompt, "one\ntwo\nthree");
    harness.wait_completed().await;
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_collect_mode_merges_backlog_into_one_run() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Collect));

    harness.enqueue("alice", "m1", "first");
    assert_eq!(harness.next_started().await.prompt, "first");
    harness.enqueue("alice", "m2", "second");
    harness.enqueue("bob", "m3", "third");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::Buffered { depth: 2, .. }))
        .await;
    assert!(harness.started.try_recv().is_err(), "second run started early");

    harness.reply("done one");
    let started = harness.next_started().await;
    let second = started
        .prompt
        .find("Queued #1 (from alice)\nsecond")
        .expect("second queued");
    let third = started
        .prompt
        .find("Queued #2 (from bob)\nthird")
        .expect("third queued");
    assert!(second < third);

    harness.reply("done two");
    harness.wait_completed().await;
    harness.wait_completed().await;
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_followup_mode_runs_each_item_and_drops_oldest_over_cap() {
    let mut options = HarnessOptions::new(QueueMode::Followup);
    options.config.queue.defaults.cap = 2;
    options.config.queue.defaults.drop_policy = DropPolicy::Old;
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "second");
    harness.enqueue("alice", "m3", "third");
    harness.enqueue("alice", "m4", "fourth");
    let dropped = harness
        .wait_for(|event| matches!(event, DispatchEvent::Dropped { .. }))
        .await;
    assert!(matches!(
        dropped,
        DispatchEvent::Dropped {
            policy: "old",
            dropped: 1,
            ..
        }
    ));

    harness.reply("r1");
    assert_eq!(harness.next_started().await.prompt, "third");
    harness.reply("r3");
    assert_eq!(harness.next_started().await.prompt, "fourth");
    harness.reply("r4");
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_summarize_policy_condenses_backlog() {
    let mut options = HarnessOptions::new(QueueMode::Followup);
    options.config.queue.defaults.cap = 1;
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "second");
    harness.enqueue("bob", "m3", "third");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::Summarized { condensed: 1, .. }))
        .await;

    harness.reply("r1");
    let started = harness.next_started().await;
    assert!(started.prompt.starts_with("[2 earlier queued message(s) condensed]"));
    assert!(started.prompt.contains("- alice: second"));
    assert!(started.prompt.contains("- bob: third"));
    harness.reply("r2");
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_interrupt_cancels_active_run_and_starts_newest() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Interrupt));
    let key = harness.key();

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "second");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::RunCancelled { .. }))
        .await;

    let entry = harness.index.get(&key).expect("index").expect("entry");
    assert!(entry.aborted_last_run);
    assert_eq!(entry.last_run_status, Some(RunStatus::Aborted));
    let store = load_auth_profile_store(&harness.auth_path).expect("auth store");
    let stats = store.usage_stats.get("openai:default").cloned().unwrap_or_default();
    assert_eq!(stats.error_count, 0);
    assert!(stats.last_used.is_some(), "cancelled run should still stamp lastUsed");

    assert_eq!(harness.next_started().await.prompt, "second");
    harness.reply("answer");
    harness.wait_completed().await;
    let entry = harness.index.get(&key).expect("index").expect("entry");
    assert!(!entry.aborted_last_run);
    assert_eq!(
        harness.message_records(),
        vec![
            (MessageRole::User, "first".to_string()),
            (MessageRole::User, "second".to_string()),
            (MessageRole::Assistant, "answer".to_string()),
        ]
    );
}

#[tokio::test]
async fn functional_steer_injects_into_live_input() {
    let mut options = HarnessOptions::new(QueueMode::Steer);
    options.live_input = true;
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "also this");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::Steered { .. }))
        .await;
    harness.reply("combined answer");
    harness.wait_completed().await;
    harness.assert_no_further_invocation().await;
    assert_eq!(
        harness.message_records(),
        vec![
            (MessageRole::User, "first".to_string()),
            (MessageRole::User, "also this".to_string()),
            (MessageRole::Assistant, "combined answer".to_string()),
        ]
    );
}

#[tokio::test]
async fn regression_steer_backlog_degrades_to_followup_without_live_input() {
    let mut harness = harness(HarnessOptions::new(QueueMode::SteerBacklog));

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "second");
    harness.enqueue("alice", "m3", "third");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::Buffered { depth: 2, .. }))
        .await;

    harness.reply("r1");
    assert_eq!(harness.next_started().await.prompt, "second");
    harness.reply("r2");
    assert_eq!(harness.next_started().await.prompt, "third");
    harness.reply("r3");
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_abort_cancels_run_and_clears_backlog() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));
    let key = harness.key();

    assert!(!harness.dispatcher.abort(&key));
    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness.enqueue("alice", "m2", "second");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::Buffered { .. }))
        .await;

    assert!(harness.dispatcher.abort(&key));
    let aborted = harness
        .wait_for(|event| matches!(event, DispatchEvent::Aborted { .. }))
        .await;
    assert!(matches!(aborted, DispatchEvent::Aborted { cleared: 1, .. }));
    harness
        .wait_for(|event| matches!(event, DispatchEvent::RunCancelled { .. }))
        .await;
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_retryable_failure_is_merged_into_next_prompt() {
    let mut options = HarnessOptions::new(QueueMode::Followup);
    options.profiles = vec![
        ("openai:a", api_key("openai", "sk-a")),
        ("openai:b", api_key("openai", "sk-b")),
    ];
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    assert_eq!(harness.next_started().await.profile_id, "openai:a");
    harness
        .replies
        .send(Err(AgentEngineError::Provider {
            reason: AuthFailureReason::RateLimit,
            message: "429 too many requests".to_string(),
        }))
        .expect("send failure");
    let failed = harness
        .wait_for(|event| matches!(event, DispatchEvent::RunFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        DispatchEvent::RunFailed {
            reason: "rate_limit",
            retryable: true,
            ..
        }
    ));
    harness.assert_no_further_invocation().await;

    harness.enqueue("alice", "m2", "second");
    let retried = harness.next_started().await;
    assert_eq!(retried.prompt, "first\n\nsecond");
    assert_eq!(retried.profile_id, "openai:b");
    harness.reply("ok");
    harness.wait_completed().await;
}

#[tokio::test]
async fn regression_engine_error_is_recorded_as_unknown_profile_failure() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness
        .replies
        .send(Err(AgentEngineError::Other("tool runtime crashed".to_string())))
        .expect("send failure");
    harness
        .wait_for(|event| {
            matches!(
                event,
                DispatchEvent::RunFailed {
                    reason: "unknown",
                    retryable: false,
                    ..
                }
            )
        })
        .await;

    let store = load_auth_profile_store(&harness.auth_path).expect("auth store");
    let stats = store.usage_stats.get("openai:default").expect("stats");
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.failure_counts.get("unknown"), Some(&1));
    assert_eq!(stats.cooldown_reason, Some(AuthFailureReason::Unknown));
    assert!(stats.last_used.is_some());
}

#[tokio::test]
async fn functional_auth_failure_emits_operator_hint_and_disables_profile() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    harness
        .replies
        .send(Err(AgentEngineError::Provider {
            reason: AuthFailureReason::Auth,
            message: "401 invalid api key".to_string(),
        }))
        .expect("send failure");
    let hint = harness
        .wait_for(|event| matches!(event, DispatchEvent::OperatorHint { .. }))
        .await;
    let DispatchEvent::OperatorHint { message, .. } = hint else {
        panic!("expected operator hint");
    };
    assert!(message.contains("re-authenticate"));
    harness
        .wait_for(|event| {
            matches!(
                event,
                DispatchEvent::RunFailed {
                    reason: "auth",
                    retryable: false,
                    ..
                }
            )
        })
        .await;

    let store = load_auth_profile_store(&harness.auth_path).expect("auth store");
    let stats = store.usage_stats.get("openai:default").expect("stats");
    assert_eq!(stats.disabled_reason, Some(AuthFailureReason::Auth));
    assert_eq!(harness.message_records(), vec![(MessageRole::User, "first".to_string())]);
}

#[tokio::test]
async fn integration_missing_credentials_fail_before_engine_invocation() {
    let mut options = HarnessOptions::new(QueueMode::Followup);
    options.profiles = Vec::new();
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::OperatorHint { .. }))
        .await;
    harness
        .wait_for(|event| matches!(event, DispatchEvent::RunFailed { reason: "auth", .. }))
        .await;
    harness.assert_no_further_invocation().await;
    let entry = harness.index.get(&harness.key()).expect("index").expect("entry");
    assert_eq!(entry.last_run_status, Some(RunStatus::Error));
    assert_eq!(entry.channel.as_deref(), Some("telegram"));
}

#[tokio::test]
async fn functional_delivered_reply_is_recorded_and_its_echo_suppressed() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.self_sender_ids = vec!["bridge".to_string()];
    let mut harness = harness(options);
    let key = harness.key();

    harness.enqueue("alice", "m1", "hello");
    harness.wait_completed().await;
    let delivered = harness.sink.delivered.lock().expect("delivered").clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].session_key, key);
    assert_eq!(delivered[0].text, "echo: hello");

    assert_eq!(
        harness.enqueue("bot", "out-1", "anything"),
        EnqueueOutcome::EchoSuppressed
    );
    assert_eq!(
        harness.enqueue("bridge", "m2", "echo:  hello"),
        EnqueueOutcome::EchoSuppressed
    );
    let other = harness.dispatcher.resolve_session_key("telegram", "bot", "bob");
    assert_eq!(
        harness.dispatcher.enqueue(&other, "bob", "out-1", "echo: hello", NOW),
        EnqueueOutcome::Accepted
    );
}

#[tokio::test]
async fn regression_user_repeating_reply_text_is_not_treated_as_echo() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));

    harness.enqueue("alice", "m1", "are you there?");
    harness.next_started().await;
    harness.reply("yes");
    harness.wait_completed().await;

    harness.clock.fetch_add(60 * 60 * 1_000, Ordering::SeqCst);
    assert_eq!(harness.enqueue("alice", "m2", "yes"), EnqueueOutcome::Accepted);
    let started = harness.next_started().await;
    assert_eq!(started.prompt, "yes");
}

#[tokio::test]
async fn regression_idle_lane_is_retired_and_respawned_on_next_message() {
    let mut options = HarnessOptions::new(QueueMode::Followup);
    options.config.lane_idle_ms = 30;
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    assert_eq!(harness.dispatcher.lane_count(), 1);
    harness.reply("one");
    harness.wait_completed().await;

    tokio::time::timeout(WAIT, async {
        while harness.dispatcher.lane_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle lane should be retired");

    assert_eq!(harness.enqueue("alice", "m2", "second"), EnqueueOutcome::Accepted);
    let started = harness.next_started().await;
    assert_eq!(started.prompt, "second");
    assert_eq!(harness.dispatcher.lane_count(), 1);
    harness.reply("two");
    harness.wait_completed().await;
}

#[tokio::test]
async fn regression_waiting_on_index_lock_keeps_runtime_responsive() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup).auto());
    let lock_path = harness.index.path().with_extension("json.lock");
    let held = tau_core::try_acquire_file_lock(&lock_path, Duration::from_secs(60))
        .expect("lock")
        .expect("lock is free");

    assert_eq!(harness.enqueue("alice", "m1", "hello"), EnqueueOutcome::Accepted);
    let started = std::time::Instant::now();
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "timers stalled for {:?} while a run waited on the index lock",
        started.elapsed()
    );

    drop(held);
    let completed = harness.wait_completed().await;
    assert!(matches!(completed, DispatchEvent::RunCompleted { .. }));
}

#[tokio::test]
async fn regression_silent_replies_are_journaled_but_not_delivered() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));

    harness.enqueue("alice", "m1", "note this");
    harness.next_started().await;
    harness.reply(SILENT_REPLY_TOKEN);
    let completed = harness.wait_completed().await;
    assert!(matches!(completed, DispatchEvent::RunCompleted { silent: true, .. }));
    assert!(harness.sink.delivered.lock().expect("delivered").is_empty());
    assert_eq!(harness.message_records().len(), 2);
}

#[tokio::test]
async fn integration_history_is_pruned_and_compaction_recorded() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.context = ContextBudgetConfig {
        context_window_tokens: 400,
        reserve_tokens: 0,
        reserve_tokens_floor: 0,
        memory_flush: MemoryFlushSettings {
            enabled: false,
            ..MemoryFlushSettings::default()
        },
        ..ContextBudgetConfig::default()
    };
    let mut harness = harness(options);
    let key = harness.key();
    let filler = "x".repeat(400);
    let history = (0..6)
        .map(|index| {
            if index % 2 == 0 {
                JournalMessage::user(format!("{index}{filler}"))
            } else {
                JournalMessage::assistant_text(format!("{index}{filler}"))
            }
        })
        .collect::<Vec<_>>();
    harness
        .journal
        .append_messages(&key, &history)
        .expect("seed history");

    harness.enqueue("alice", "m1", "next");
    let started = harness.next_started().await;
    assert!(started.history.len() < history.len());
    assert_eq!(started.history[0].role, MessageRole::System);
    assert!(started.history[0]
        .text_content()
        .starts_with("Summary of earlier conversation:"));
    let pruned = harness
        .wait_for(|event| matches!(event, DispatchEvent::HistoryPruned { .. }))
        .await;
    let DispatchEvent::HistoryPruned {
        dropped_messages, ..
    } = pruned
    else {
        panic!("expected prune event");
    };
    assert!(dropped_messages > 0);
    harness.wait_completed().await;

    let entry = harness.index.get(&key).expect("index").expect("entry");
    assert_eq!(entry.compaction_count, 1);
    let records = harness.journal.read_entries(&key).expect("read").records;
    assert!(records
        .iter()
        .any(|record| matches!(record, JournalRecord::Compaction(_))));
    let context = harness.journal.context(&key).expect("context");
    assert!(context.summary.is_some());
    assert_eq!(context.messages.len(), history.len() - dropped_messages + 2);
}

#[tokio::test]
async fn regression_prior_summary_counts_against_history_budget() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.context = ContextBudgetConfig {
        context_window_tokens: 400,
        reserve_tokens: 0,
        reserve_tokens_floor: 0,
        max_history_share: 1.0,
        memory_flush: MemoryFlushSettings {
            enabled: false,
            ..MemoryFlushSettings::default()
        },
        ..ContextBudgetConfig::default()
    };
    let mut harness = harness(options);
    let key = harness.key();
    harness
        .journal
        .append_compaction(&key, &"s".repeat(1_000), None, 900)
        .expect("seed compaction");
    let filler = "x".repeat(400);
    harness
        .journal
        .append_messages(
            &key,
            &[
                JournalMessage::user(format!("0{filler}")),
                JournalMessage::assistant_text(format!("1{filler}")),
            ],
        )
        .expect("seed history");

    harness.enqueue("alice", "m1", "next");
    let started = harness.next_started().await;
    let sent_tokens =
        estimate_messages_tokens(&started.history).saturating_add(estimate_text_tokens("next"));
    assert!(sent_tokens <= 400, "invocation carried {sent_tokens} tokens");
    assert_eq!(started.history[0].role, MessageRole::System);
    harness
        .wait_for(|event| matches!(event, DispatchEvent::HistoryPruned { .. }))
        .await;
    harness.wait_completed().await;
}

#[tokio::test]
async fn functional_memory_flush_runs_once_per_compaction_cycle() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.context = ContextBudgetConfig {
        context_window_tokens: 30_000,
        ..ContextBudgetConfig::default()
    };
    let mut harness = harness(options);
    let key = harness.key();
    harness
        .index
        .update(&key, |entry| entry.record_usage(6_000, 0))
        .expect("seed usage");

    harness.enqueue("alice", "m1", "hello");
    let flush = harness.next_started().await;
    assert_eq!(flush.kind, InvocationKind::MemoryFlush);
    assert!(flush.prompt.ends_with(SILENT_REPLY_TOKEN));
    let turn = harness.next_started().await;
    assert_eq!(turn.kind, InvocationKind::UserTurn);
    harness
        .wait_for(|event| matches!(event, DispatchEvent::MemoryFlushed { .. }))
        .await;
    harness.wait_completed().await;
    let entry = harness.index.get(&key).expect("index").expect("entry");
    assert_eq!(entry.memory_flush_compaction_count, Some(0));

    harness
        .index
        .update(&key, |entry| entry.record_usage(6_000, 0))
        .expect("seed usage again");
    harness.enqueue("alice", "m2", "again");
    assert_eq!(harness.next_started().await.kind, InvocationKind::UserTurn);
    harness.wait_completed().await;
    harness.assert_no_further_invocation().await;
}

#[tokio::test]
async fn functional_cache_keepalive_runs_only_inside_refresh_window() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.default_provider = "anthropic".to_string();
    options.config.default_model = "claude-sonnet-4-5".to_string();
    options.profiles = vec![("anthropic:default", api_key("anthropic", "sk-ant"))];
    let mut harness = harness(options);
    let key = harness.key();

    harness.enqueue("alice", "m1", "hello");
    harness.next_started().await;
    harness.wait_completed().await;

    assert!(harness.dispatcher.keep_cache_warm(&key));
    harness
        .wait_for(|event| matches!(event, DispatchEvent::CacheKeepaliveSkipped { .. }))
        .await;
    harness.assert_no_further_invocation().await;

    harness.clock.store(NOW + 280_000, Ordering::SeqCst);
    assert!(harness.dispatcher.keep_cache_warm(&key));
    let keepalive = harness.next_started().await;
    assert_eq!(keepalive.kind, InvocationKind::CacheKeepalive);
    harness.wait_completed().await;
    assert_eq!(harness.message_records().len(), 2);
    assert_eq!(harness.sink.delivered.lock().expect("delivered").len(), 1);
}

#[tokio::test]
async fn integration_sandbox_is_enabled_only_outside_the_main_session() {
    let mut options = HarnessOptions::new(QueueMode::Followup).auto();
    options.config.sandbox = SandboxSettings {
        defaults: SandboxConfig {
            mode: Some(SandboxMode::NonMain),
            ..SandboxConfig::default()
        },
        ..SandboxSettings::default()
    };
    let mut harness = harness(options);

    harness.enqueue("alice", "m1", "from a peer");
    assert!(harness.next_started().await.sandbox_enabled);
    harness.wait_completed().await;

    let main = harness.dispatcher.main_session_key();
    harness.dispatcher.enqueue(&main, "operator", "m2", "from main", NOW);
    assert!(!harness.next_started().await.sandbox_enabled);
    harness.wait_completed().await;
}

#[tokio::test]
async fn functional_queue_override_is_scoped_to_one_session() {
    let harness = harness(HarnessOptions::new(QueueMode::Collect).auto());
    let key = harness.key();
    let other = harness.dispatcher.resolve_session_key("slack", "team", "bob");

    harness.dispatcher.set_queue_override(
        &key,
        Some(QueueSettingsOverride {
            mode: Some(QueueMode::Interrupt),
            ..QueueSettingsOverride::default()
        }),
    );
    assert_eq!(harness.dispatcher.settings_for_session(&key).mode, QueueMode::Interrupt);
    assert_eq!(harness.dispatcher.settings_for_session(&other).mode, QueueMode::Collect);

    harness.dispatcher.set_queue_override(&key, None);
    assert_eq!(harness.dispatcher.settings_for_session(&key).mode, QueueMode::Collect);
}

#[tokio::test]
async fn functional_shutdown_cancels_active_runs_and_rejects_new_messages() {
    let mut harness = harness(HarnessOptions::new(QueueMode::Followup));

    harness.enqueue("alice", "m1", "first");
    harness.next_started().await;
    tokio::time::timeout(WAIT, harness.dispatcher.shutdown())
        .await
        .expect("shutdown completes");
    harness
        .wait_for(|event| matches!(event, DispatchEvent::RunCancelled { .. }))
        .await;
    assert_eq!(harness.enqueue("alice", "m2", "late"), EnqueueOutcome::ShuttingDown);
    assert!(!harness.dispatcher.keep_cache_warm(&harness.key()));
}
