use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tau_context::{estimate_messages_tokens, estimate_text_tokens, SILENT_REPLY_TOKEN};
use tau_core::current_unix_timestamp_ms;
use tau_dispatch::{
    AgentEngine, AgentEngineError, AgentInvocation, AgentTurnResult, DispatchEvent,
    DispatcherDependencies, InboundDispatcher, InvocationKind, TurnUsage,
};
use tau_provider::{normalize_provider_id, AuthCredential, AuthProfileResolver};

use crate::bootstrap_helpers::{build_credential_resolver, build_session_stores};
use crate::gateway_config::{GatewayConfig, GatewayPaths};

const DRY_RUN_SECRET: &str = "dry-run";
const REPLAY_POLL_MS: u64 = 20;
const REPLAY_DRAIN_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Identifies a session by its channel coordinates; all empty means the
/// agent's main session.
pub(crate) struct FixtureTarget {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub peer: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// One line of a replay fixture.
pub(crate) enum FixtureEvent {
    Message {
        #[serde(flatten)]
        target: FixtureTarget,
        sender: String,
        #[serde(default, rename = "messageId")]
        message_id: String,
        content: String,
    },
    Abort {
        #[serde(flatten)]
        target: FixtureTarget,
    },
    Keepalive {
        #[serde(flatten)]
        target: FixtureTarget,
    },
    Wait {
        ms: u64,
    },
}

pub(crate) fn parse_fixture(raw: &str) -> Result<Vec<FixtureEvent>> {
    let mut events = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str::<FixtureEvent>(trimmed)
            .with_context(|| format!("invalid fixture event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Engine used by replays: echoes the prompt and stays silent on
/// housekeeping turns. An optional latency keeps runs busy long enough for
/// queue modes to matter, and honors cancellation while waiting.
pub(crate) struct DryRunEngine {
    latency: Duration,
}

impl DryRunEngine {
    pub(crate) fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
        }
    }
}

#[async_trait]
impl AgentEngine for DryRunEngine {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentTurnResult, AgentEngineError> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = invocation.cancel.cancelled() => return Err(AgentEngineError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }
        let output = match invocation.kind {
            InvocationKind::UserTurn => format!("echo: {}", invocation.prompt),
            InvocationKind::MemoryFlush => SILENT_REPLY_TOKEN.to_string(),
            InvocationKind::CacheKeepalive => String::new(),
        };
        let usage = TurnUsage {
            input_tokens: estimate_messages_tokens(&invocation.history)
                + estimate_text_tokens(&invocation.prompt),
            output_tokens: estimate_text_tokens(&output),
        };
        Ok(AgentTurnResult {
            output,
            usage,
            stop_reason: Some("end_turn".to_string()),
            steered_inputs: Vec::new(),
        })
    }
}

/// Gives the default provider a dry-run API key when the store has no
/// profile for it, so replays never stall on credential resolution.
pub(crate) async fn seed_dry_run_profile(resolver: &AuthProfileResolver, provider: &str) -> Result<bool> {
    let provider = normalize_provider_id(provider);
    let store = resolver.load_store()?;
    if !store.ordered_profile_ids(&provider).is_empty() {
        return Ok(false);
    }
    let profile_id = format!("{provider}:{DRY_RUN_SECRET}");
    resolver
        .upsert_profile(
            &profile_id,
            AuthCredential::ApiKey {
                provider: provider.clone(),
                key: DRY_RUN_SECRET.to_string(),
            },
        )
        .await?;
    tracing::info!(profile_id = %profile_id, "seeded dry-run credential");
    Ok(true)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn runs_settled(events: &[DispatchEvent]) -> bool {
    let mut started = 0usize;
    let mut finished = 0usize;
    for event in events {
        match event {
            DispatchEvent::RunStarted { .. } => started += 1,
            DispatchEvent::RunCompleted { .. }
            | DispatchEvent::RunFailed { .. }
            | DispatchEvent::RunCancelled { .. }
            | DispatchEvent::CacheKeepaliveSkipped { .. } => finished += 1,
            _ => {}
        }
    }
    started == finished
}

/// Feeds fixture events through a real dispatcher and returns every
/// dispatch event it emitted, in emission order.
pub(crate) async fn run_replay(
    config: &GatewayConfig,
    paths: &GatewayPaths,
    fixture: &Path,
    settle_ms: u64,
    latency_ms: u64,
) -> Result<Vec<DispatchEvent>> {
    let raw = std::fs::read_to_string(fixture)
        .with_context(|| format!("failed to read replay fixture {}", fixture.display()))?;
    let fixture_events = parse_fixture(&raw)?;
    if fixture_events.is_empty() {
        bail!("replay fixture {} contains no events", fixture.display());
    }

    let credentials = build_credential_resolver(config, paths)?;
    seed_dry_run_profile(&credentials, &config.dispatcher.default_provider).await?;
    let (journal, index) = build_session_stores(paths);

    let collected = Arc::new(Mutex::new(Vec::<DispatchEvent>::new()));
    let sink_events = Arc::clone(&collected);
    let dependencies = DispatcherDependencies::new(
        Arc::new(DryRunEngine::new(latency_ms)),
        credentials,
        journal,
        index,
    )
    .with_event_sink(Arc::new(move |event: &DispatchEvent| {
        lock_or_recover(&sink_events).push(event.clone());
    }));
    let dispatcher = InboundDispatcher::new(config.dispatcher.clone(), dependencies);

    for event in fixture_events {
        match event {
            FixtureEvent::Message {
                target,
                sender,
                message_id,
                content,
            } => {
                let session_key = session_key_for(&dispatcher, &target);
                let outcome = dispatcher.enqueue(
                    &session_key,
                    &sender,
                    &message_id,
                    &content,
                    current_unix_timestamp_ms(),
                );
                tracing::debug!(session_key = %session_key, ?outcome, "replayed inbound message");
            }
            FixtureEvent::Abort { target } => {
                let session_key = session_key_for(&dispatcher, &target);
                if !dispatcher.abort(&session_key) {
                    tracing::warn!(session_key = %session_key, "abort for a session with no lane");
                }
            }
            FixtureEvent::Keepalive { target } => {
                let session_key = session_key_for(&dispatcher, &target);
                dispatcher.keep_cache_warm(&session_key);
            }
            FixtureEvent::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }

    tokio::time::sleep(Duration::from_millis(settle_ms)).await;
    let mut waited = 0u64;
    while !runs_settled(&lock_or_recover(&collected)) {
        if waited >= REPLAY_DRAIN_TIMEOUT_MS {
            tracing::warn!("replay runs did not settle within {REPLAY_DRAIN_TIMEOUT_MS}ms");
            break;
        }
        tokio::time::sleep(Duration::from_millis(REPLAY_POLL_MS)).await;
        waited += REPLAY_POLL_MS;
    }
    dispatcher.shutdown().await;

    let events = lock_or_recover(&collected).clone();
    Ok(events)
}

fn session_key_for(dispatcher: &InboundDispatcher, target: &FixtureTarget) -> String {
    match (&target.channel, &target.account, &target.peer) {
        (None, None, None) => dispatcher.main_session_key(),
        (channel, account, peer) => dispatcher.resolve_session_key(
            channel.as_deref().unwrap_or_default(),
            account.as_deref().unwrap_or_default(),
            peer.as_deref().unwrap_or_default(),
        ),
    }
}
