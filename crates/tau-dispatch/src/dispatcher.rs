use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tau_context::{ContextBudgetConfig, ContextBudgetGovernor};
use tau_core::{current_unix_timestamp_ms, ClockFn};
use tau_provider::AuthProfileResolver;
use tau_sandbox::SandboxSettings;
use tau_session::{SessionIndexStore, SessionJournalStore};
use tokio::sync::{mpsc, oneshot};

use crate::agent_engine::AgentEngine;
use crate::dedupe::{InboundDedupeTracker, DEFAULT_DEDUPE_CAPACITY};
use crate::dispatch_events::{DispatchEvent, DispatchEventSink};
use crate::governed_run::{lock_or_recover, RunServices};
use crate::queue_settings::{DedupeMode, QueueConfig, QueueSettings, QueueSettingsOverride};
use crate::reply_sink::ReplySink;
use crate::sent_message_cache::{
    SentMessageCache, DEFAULT_SENT_MESSAGE_SWEEP_THRESHOLD, DEFAULT_SENT_MESSAGE_TTL_MS,
};
use crate::session_key::{main_session_key, parse_session_key, resolve_session_key};
use crate::session_lane::{InboundItem, LaneCommand, LaneHandle, LaneRegistry, SessionLane};

pub const DEFAULT_AGENT_ID: &str = "main";
pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_LANE_IDLE_MS: u64 = 10 * 60 * 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
/// Public struct `DispatcherConfig` used across Tau components.
pub struct DispatcherConfig {
    pub agent_id: String,
    pub default_provider: String,
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub queue: QueueConfig,
    pub context: ContextBudgetConfig,
    pub sandbox: SandboxSettings,
    pub dedupe_capacity: usize,
    pub echo_ttl_ms: u64,
    /// Sender ids the gateway itself posts under; only their messages are
    /// matched against recent reply text.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub self_sender_ids: Vec<String>,
    /// Idle time after which a session lane with nothing buffered exits.
    pub lane_idle_ms: u64,
    /// How long a cancelled run may keep running before it is abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            default_provider: DEFAULT_PROVIDER.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            queue: QueueConfig::default(),
            context: ContextBudgetConfig::default(),
            sandbox: SandboxSettings::default(),
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            echo_ttl_ms: DEFAULT_SENT_MESSAGE_TTL_MS,
            self_sender_ids: Vec::new(),
            lane_idle_ms: DEFAULT_LANE_IDLE_MS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
        }
    }
}

/// Collaborators injected into the dispatcher.
pub struct DispatcherDependencies {
    engine: Arc<dyn AgentEngine>,
    credentials: AuthProfileResolver,
    journal: SessionJournalStore,
    index: SessionIndexStore,
    reply_sink: Option<Arc<dyn ReplySink>>,
    events: Option<DispatchEventSink>,
    clock: ClockFn,
}

impl DispatcherDependencies {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        credentials: AuthProfileResolver,
        journal: SessionJournalStore,
        index: SessionIndexStore,
    ) -> Self {
        Self {
            engine,
            credentials,
            journal,
            index,
            reply_sink: None,
            events: None,
            clock: Arc::new(current_unix_timestamp_ms),
        }
    }

    pub fn with_reply_sink(mut self, reply_sink: Arc<dyn ReplySink>) -> Self {
        self.reply_sink = Some(reply_sink);
        self
    }

    pub fn with_event_sink(mut self, events: DispatchEventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// What happened to one `enqueue` call.
pub enum EnqueueOutcome {
    Accepted,
    Duplicate,
    EchoSuppressed,
    ShuttingDown,
}

/// Routes inbound messages to per-session lanes. Lanes are spawned on the
/// ambient tokio runtime, so every method that may create one must be called
/// from within it.
pub struct InboundDispatcher {
    services: Arc<RunServices>,
    lanes: LaneRegistry,
    lane_generations: AtomicU64,
    dedupe: Mutex<InboundDedupeTracker>,
    overrides: Mutex<HashMap<String, QueueSettingsOverride>>,
    run_ids: Arc<AtomicU64>,
    shutting_down: AtomicBool,
}

impl InboundDispatcher {
    pub fn new(config: DispatcherConfig, dependencies: DispatcherDependencies) -> Self {
        let governor = ContextBudgetGovernor::new(config.context.clone());
        let dedupe = InboundDedupeTracker::new(config.dedupe_capacity);
        let sent_messages =
            SentMessageCache::new(config.echo_ttl_ms, DEFAULT_SENT_MESSAGE_SWEEP_THRESHOLD);
        let services = RunServices {
            config,
            governor,
            engine: dependencies.engine,
            credentials: dependencies.credentials,
            journal: dependencies.journal,
            index: dependencies.index,
            reply_sink: dependencies.reply_sink,
            events: dependencies.events,
            sent_messages: Arc::new(Mutex::new(sent_messages)),
            clock: dependencies.clock,
        };
        Self {
            services: Arc::new(services),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            lane_generations: AtomicU64::new(0),
            dedupe: Mutex::new(dedupe),
            overrides: Mutex::new(HashMap::new()),
            run_ids: Arc::new(AtomicU64::new(0)),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.services.config
    }

    pub fn resolve_session_key(&self, channel: &str, account: &str, peer: &str) -> String {
        resolve_session_key(&self.services.config.agent_id, channel, account, peer)
    }

    pub fn main_session_key(&self) -> String {
        main_session_key(&self.services.config.agent_id)
    }

    /// Effective queue settings: channel defaults plus any session override.
    pub fn settings_for_session(&self, session_key: &str) -> QueueSettings {
        let base = self.base_settings(session_key);
        match lock_or_recover(&self.overrides).get(session_key) {
            Some(overrides) => base.with_override(overrides),
            None => base,
        }
    }

    /// Echo suppression and dedupe run here; surviving messages go to the
    /// session's lane for debounce and queueing.
    pub fn enqueue(
        &self,
        session_key: &str,
        sender_id: &str,
        message_id: &str,
        content: &str,
        arrival_ms: u64,
    ) -> EnqueueOutcome {
        if self.shutting_down.load(Ordering::SeqCst) {
            return EnqueueOutcome::ShuttingDown;
        }
        let now = (self.services.clock)();
        if self.is_echo(session_key, sender_id, message_id, content, now) {
            tracing::debug!(session_key = %session_key, sender_id = %sender_id, "suppressed echo of own reply");
            self.services.emit(DispatchEvent::EchoSuppressed {
                session_key: session_key.to_string(),
                sender_id: sender_id.to_string(),
            });
            return EnqueueOutcome::EchoSuppressed;
        }

        let settings = self.settings_for_session(session_key);
        if let Some(dedupe_key) = dedupe_key(settings.dedupe_mode, session_key, sender_id, message_id, content) {
            if !lock_or_recover(&self.dedupe).check_and_record(&dedupe_key) {
                tracing::debug!(session_key = %session_key, message_id = %message_id, "dropped duplicate inbound message");
                self.services.emit(DispatchEvent::Deduplicated {
                    session_key: session_key.to_string(),
                    message_id: message_id.to_string(),
                });
                return EnqueueOutcome::Duplicate;
            }
        }

        self.send_to_lane(
            session_key,
            LaneCommand::Inbound(InboundItem {
                sender_id: sender_id.to_string(),
                message_id: message_id.to_string(),
                content: content.to_string(),
                arrival_ms,
            }),
        );
        EnqueueOutcome::Accepted
    }

    /// Cancels the active run and clears buffered messages. Returns false
    /// when the session has no lane.
    pub fn abort(&self, session_key: &str) -> bool {
        let lanes = lock_or_recover(&self.lanes);
        match lanes.get(session_key) {
            Some(lane) => lane.commands.send(LaneCommand::Abort).is_ok(),
            None => false,
        }
    }

    /// Sets or clears (with `None`) the session's queue override. Held in
    /// memory only.
    pub fn set_queue_override(&self, session_key: &str, overrides: Option<QueueSettingsOverride>) {
        {
            let mut stored = lock_or_recover(&self.overrides);
            match overrides {
                Some(value) => {
                    stored.insert(session_key.to_string(), value);
                }
                None => {
                    stored.remove(session_key);
                }
            }
        }
        let lanes = lock_or_recover(&self.lanes);
        if let Some(lane) = lanes.get(session_key) {
            let _ = lane.commands.send(LaneCommand::SetQueueOverride(overrides));
        }
    }

    /// Requests a cache keepalive run if the session is idle and its prompt
    /// cache is about to expire.
    pub fn keep_cache_warm(&self, session_key: &str) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        self.send_to_lane(session_key, LaneCommand::KeepCacheWarm);
        true
    }

    /// Number of session lanes currently alive.
    pub fn lane_count(&self) -> usize {
        lock_or_recover(&self.lanes).len()
    }

    /// Stops accepting messages, cancels active runs and waits for every
    /// lane to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let lanes = lock_or_recover(&self.lanes).drain().collect::<Vec<_>>();
        let mut waiting = Vec::with_capacity(lanes.len());
        for (session_key, lane) in lanes {
            let (ack_tx, ack_rx) = oneshot::channel();
            if lane.commands.send(LaneCommand::Shutdown(ack_tx)).is_err() {
                tracing::debug!(session_key = %session_key, "lane already stopped");
            }
            waiting.push((session_key, ack_rx, lane.task));
        }
        for (session_key, ack_rx, task) in waiting {
            let _ = ack_rx.await;
            if let Err(error) = task.await {
                tracing::warn!(session_key = %session_key, "session lane task failed: {error}");
            }
        }
        tracing::info!("dispatcher shut down");
    }

    fn is_echo(
        &self,
        session_key: &str,
        sender_id: &str,
        message_id: &str,
        content: &str,
        now: u64,
    ) -> bool {
        let sent = lock_or_recover(&self.services.sent_messages);
        if sent.was_sent_with_id(session_key, message_id, now) {
            return true;
        }
        let from_self = self
            .services
            .config
            .self_sender_ids
            .iter()
            .any(|self_id| self_id == sender_id);
        from_self && sent.was_recently_sent(session_key, content, now)
    }

    fn base_settings(&self, session_key: &str) -> QueueSettings {
        let queue = &self.services.config.queue;
        match parse_session_key(session_key).and_then(|parts| parts.channel) {
            Some(channel) => queue.settings_for_channel(&channel),
            None => queue.defaults,
        }
    }

    fn send_to_lane(&self, session_key: &str, command: LaneCommand) {
        let mut lanes = lock_or_recover(&self.lanes);
        if lanes
            .get(session_key)
            .is_some_and(|lane| lane.commands.is_closed())
        {
            lanes.remove(session_key);
        }
        let lane = lanes
            .entry(session_key.to_string())
            .or_insert_with(|| self.spawn_lane(session_key));
        if lane.commands.send(command).is_err() {
            tracing::warn!(session_key = %session_key, "session lane closed; command dropped");
        }
    }

    fn spawn_lane(&self, session_key: &str) -> LaneHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let queue_override = lock_or_recover(&self.overrides).get(session_key).copied();
        let generation = self.lane_generations.fetch_add(1, Ordering::SeqCst) + 1;
        let lane = SessionLane::new(
            session_key.to_string(),
            Arc::clone(&self.services),
            self.base_settings(session_key),
            queue_override,
            Arc::clone(&self.run_ids),
            Arc::clone(&self.lanes),
            generation,
            receiver,
        );
        tracing::debug!(session_key = %session_key, generation, "spawned session lane");
        LaneHandle {
            commands,
            task: tokio::spawn(lane.run()),
            generation,
        }
    }
}

fn dedupe_key(
    mode: DedupeMode,
    session_key: &str,
    sender_id: &str,
    message_id: &str,
    content: &str,
) -> Option<String> {
    match mode {
        DedupeMode::MessageId if !message_id.trim().is_empty() => {
            Some(format!("{session_key}|id|{}", message_id.trim()))
        }
        DedupeMode::Prompt => Some(format!("{session_key}|prompt|{sender_id}|{}", content.trim())),
        DedupeMode::MessageId | DedupeMode::None => None,
    }
}
