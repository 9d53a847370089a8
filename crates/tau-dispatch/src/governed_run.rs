//! One governed agent run: session entry, journal repair, credential and
//! sandbox resolution, memory flush, history pruning, engine invocation,
//! then persistence of the outcome.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;

use tau_context::{
    compaction_summary, estimate_messages_tokens, estimate_text_tokens, is_silent_reply,
    CacheTtlMarker, ContextBudgetGovernor, CACHE_TTL_CUSTOM_TYPE,
};
use tau_core::ClockFn;
use tau_provider::{
    AuthFailureReason, AuthProfileResolver, CredentialError, ProfilePin, ResolvedCredential,
};
use tau_sandbox::{resolve_sandbox_context, SandboxRequest};
use tau_session::{
    AuthProfileOverrideSource, JournalMessage, RunStatus, SessionEntry, SessionIndexStore,
    SessionJournalStore,
};
use tokio::sync::mpsc;

use crate::agent_engine::{
    AgentEngine, AgentEngineError, AgentInvocation, AgentTurnResult, InvocationKind, TurnUsage,
};
use crate::cancellation::CooperativeCancellationToken;
use crate::dispatch_events::{emit, DispatchEvent, DispatchEventSink};
use crate::dispatcher::DispatcherConfig;
use crate::reply_sink::{DeliveryReceipt, OutboundReply, ReplySink};
use crate::sent_message_cache::SentMessageCache;
use crate::session_key::{main_session_key, parse_session_key};

/// Shared collaborators every session lane runs against.
pub(crate) struct RunServices {
    pub config: DispatcherConfig,
    pub governor: ContextBudgetGovernor,
    pub engine: Arc<dyn AgentEngine>,
    pub credentials: AuthProfileResolver,
    pub journal: SessionJournalStore,
    pub index: SessionIndexStore,
    pub reply_sink: Option<Arc<dyn ReplySink>>,
    pub events: Option<DispatchEventSink>,
    pub sent_messages: Arc<Mutex<SentMessageCache>>,
    pub clock: ClockFn,
}

impl RunServices {
    pub fn emit(&self, event: DispatchEvent) {
        emit(self.events.as_ref(), event);
    }

    /// Locked index update on the blocking pool. The index and journal wait
    /// on file locks, which must not stall the async workers.
    pub async fn update_index<F>(
        &self,
        session_key: &str,
        mutate: F,
    ) -> anyhow::Result<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry) + Send + 'static,
    {
        let index = self.index.clone();
        let session_key = session_key.to_string();
        run_blocking(move || index.update(&session_key, mutate)).await
    }

    pub async fn with_journal<T, F>(&self, operation: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SessionJournalStore) -> anyhow::Result<T> + Send + 'static,
    {
        let journal = self.journal.clone();
        run_blocking(move || operation(&journal)).await
    }
}

async fn run_blocking<T, F>(operation: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .context("session store task did not complete")?
}

pub(crate) struct RunRequest {
    pub run_id: u64,
    pub session_key: String,
    pub kind: InvocationKind,
    pub prompt: String,
    pub sender_id: Option<String>,
    pub cancel: CooperativeCancellationToken,
    pub live_input: Option<mpsc::Receiver<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Skipped,
    Cancelled,
    Failed {
        reason: AuthFailureReason,
        retryable: bool,
    },
}

enum RunError {
    Credential(CredentialError),
    Engine {
        error: AgentEngineError,
        profile_id: String,
    },
    Store(anyhow::Error),
}

impl From<anyhow::Error> for RunError {
    fn from(error: anyhow::Error) -> Self {
        RunError::Store(error)
    }
}

pub(crate) async fn execute_governed_run(services: &RunServices, request: RunRequest) -> RunOutcome {
    let session_key = request.session_key.clone();
    let run_id = request.run_id;
    let kind = request.kind;
    let prompt = request.prompt.clone();
    let sender_id = request.sender_id.clone();

    let error = match run_pipeline(services, request).await {
        Ok(outcome) => return outcome,
        Err(error) => error,
    };

    let (reason, message) = match error {
        RunError::Engine {
            error: AgentEngineError::Cancelled,
            ..
        } => {
            tracing::info!(session_key = %session_key, run_id, "run cancelled");
            if kind == InvocationKind::UserTurn {
                persist_prompt(services, &session_key, sender_id.as_deref(), &prompt).await;
            }
            update_entry(services, &session_key, |entry| {
                entry.aborted_last_run = true;
                entry.last_run_status = Some(RunStatus::Aborted);
            })
            .await;
            services.emit(DispatchEvent::RunCancelled {
                session_key,
                run_id,
            });
            return RunOutcome::Cancelled;
        }
        RunError::Engine {
            error: AgentEngineError::Provider { reason, message },
            profile_id,
        } => {
            record_profile_failure(services, &profile_id, reason).await;
            (reason, message)
        }
        RunError::Engine {
            error: AgentEngineError::Other(message),
            profile_id,
        } => {
            record_profile_failure(services, &profile_id, AuthFailureReason::Unknown).await;
            (AuthFailureReason::Unknown, message)
        }
        RunError::Credential(error) => (error.reason(), error.to_string()),
        RunError::Store(error) => (AuthFailureReason::Unknown, format!("{error:#}")),
    };

    let retryable = reason.is_retryable() && kind == InvocationKind::UserTurn;
    tracing::warn!(
        session_key = %session_key,
        run_id,
        reason = reason.as_str(),
        retryable,
        "agent run failed: {message}"
    );
    if kind == InvocationKind::UserTurn && !retryable {
        persist_prompt(services, &session_key, sender_id.as_deref(), &prompt).await;
    }
    update_entry(services, &session_key, |entry| {
        entry.aborted_last_run = false;
        entry.last_run_status = Some(RunStatus::Error);
    })
    .await;
    if reason == AuthFailureReason::Auth {
        services.emit(DispatchEvent::OperatorHint {
            session_key: session_key.clone(),
            message: format!(
                "credentials were rejected ({message}); re-authenticate the provider profile"
            ),
        });
    }
    services.emit(DispatchEvent::RunFailed {
        session_key,
        run_id,
        reason: reason.as_str(),
        retryable,
        message,
    });
    RunOutcome::Failed { reason, retryable }
}

async fn run_pipeline(services: &RunServices, request: RunRequest) -> Result<RunOutcome, RunError> {
    let RunRequest {
        run_id,
        session_key,
        kind,
        prompt,
        sender_id,
        cancel,
        live_input,
    } = request;
    let key_parts = parse_session_key(&session_key);
    let agent_id = key_parts
        .as_ref()
        .map(|parts| parts.agent_id.clone())
        .unwrap_or_else(|| services.config.agent_id.clone());
    let channel = key_parts.and_then(|parts| parts.channel);

    let entry = services
        .update_index(&session_key, move |entry| {
            if entry.channel.is_none() {
                entry.channel = channel;
            }
        })
        .await?;

    let repair = {
        let session_key = session_key.clone();
        services
            .with_journal(move |journal| journal.repair_if_needed(&session_key))
            .await?
    };
    if repair.repaired {
        tracing::warn!(
            session_key = %session_key,
            dropped_lines = repair.dropped_lines,
            backup = ?repair.backup_path,
            "repaired session journal"
        );
        services.emit(DispatchEvent::JournalRepaired {
            session_key: session_key.clone(),
            dropped_lines: repair.dropped_lines,
        });
    }

    let provider = entry
        .provider_override()
        .unwrap_or(&services.config.default_provider)
        .to_string();
    let model = entry
        .model()
        .unwrap_or(&services.config.default_model)
        .to_string();

    if kind == InvocationKind::CacheKeepalive {
        let records = {
            let session_key = session_key.clone();
            services
                .with_journal(move |journal| journal.read_entries(&session_key))
                .await?
                .records
        };
        let now = (services.clock)();
        if !services
            .governor
            .cache_keepalive_due(&provider, &model, &records, now)
        {
            services.emit(DispatchEvent::CacheKeepaliveSkipped {
                session_key: session_key.clone(),
            });
            return Ok(RunOutcome::Skipped);
        }
    }

    let credential = resolve_credential(services, &session_key, &entry, &provider).await?;
    let profile_id = credential.profile_id.clone();
    let engine_error = |error: AgentEngineError| RunError::Engine {
        error,
        profile_id: profile_id.clone(),
    };

    let sandbox = resolve_sandbox_context(
        &services.config.sandbox,
        &SandboxRequest {
            agent_id: &agent_id,
            session_key: &session_key,
            is_main_session: session_key == main_session_key(&agent_id),
        },
    );

    let context = {
        let session_key = session_key.clone();
        services
            .with_journal(move |journal| journal.context(&session_key))
            .await?
    };
    let mut summary = context.summary.clone();
    let (entry_ids, history): (Vec<u64>, Vec<JournalMessage>) =
        context.messages.into_iter().unzip();

    let mut spent_tokens = estimate_text_tokens(&prompt);
    if kind == InvocationKind::UserTurn && services.governor.should_flush_memory(Some(&entry)) {
        let flush = &services.config.context.memory_flush;
        let flush_prompt = flush.flush_prompt();
        let invocation = AgentInvocation {
            kind: InvocationKind::MemoryFlush,
            session_key: session_key.clone(),
            system_prompt: Some(flush.flush_system_prompt()),
            prompt: flush_prompt.clone(),
            history: with_summary(summary.as_deref(), history.clone()),
            provider: provider.clone(),
            model: model.clone(),
            credential: credential.clone(),
            sandbox: sandbox.clone(),
            cancel: cancel.clone(),
            live_input: None,
        };
        match invoke_with_grace(services, invocation, &cancel).await {
            Ok(result) => {
                let tokens = estimate_text_tokens(&flush_prompt)
                    .saturating_add(reported_or_estimated_output(&result));
                spent_tokens = spent_tokens.saturating_add(tokens);
                let compaction_count = entry.compaction_count;
                services
                    .update_index(&session_key, move |entry| {
                        entry.memory_flush_compaction_count = Some(compaction_count);
                    })
                    .await?;
                tracing::info!(session_key = %session_key, run_id, tokens, "memory flush completed");
                services.emit(DispatchEvent::MemoryFlushed {
                    session_key: session_key.clone(),
                    run_id,
                    tokens,
                });
            }
            Err(AgentEngineError::Cancelled) => return Err(engine_error(AgentEngineError::Cancelled)),
            Err(error) => {
                tracing::warn!(session_key = %session_key, run_id, "memory flush failed: {error}");
            }
        }
    }

    // The summary rides in front of the kept history, so its tokens come out
    // of the same budget.
    let summary_tokens = summary_message_tokens(summary.as_deref());
    let mut plan = services
        .governor
        .plan_history(&history, spent_tokens.saturating_add(summary_tokens));
    if plan.dropped_messages > 0 {
        let mut text = compaction_summary(&plan);
        let text_tokens = summary_message_tokens(Some(&text));
        if text_tokens > summary_tokens {
            plan = services
                .governor
                .plan_history(&history, spent_tokens.saturating_add(text_tokens));
            text = compaction_summary(&plan);
        }
        let first_kept = entry_ids.get(plan.dropped_messages).copied();
        let tokens_before = plan.dropped_tokens.saturating_add(plan.kept_tokens);
        {
            let session_key = session_key.clone();
            let text = text.clone();
            services
                .with_journal(move |journal| {
                    journal.append_compaction(&session_key, &text, first_kept, tokens_before)
                })
                .await?;
        }
        let compacted = services
            .update_index(&session_key, |entry| {
                entry.compaction_count = entry.compaction_count.saturating_add(1);
            })
            .await?;
        tracing::info!(
            session_key = %session_key,
            run_id,
            dropped_messages = plan.dropped_messages,
            dropped_tokens = plan.dropped_tokens,
            compaction_count = compacted.compaction_count,
            "pruned session history"
        );
        services.emit(DispatchEvent::HistoryPruned {
            session_key: session_key.clone(),
            run_id,
            dropped_messages: plan.dropped_messages,
            dropped_tokens: plan.dropped_tokens,
        });
        summary = Some(text);
    }

    if cancel.is_cancelled() {
        return Err(engine_error(AgentEngineError::Cancelled));
    }

    let history = with_summary(summary.as_deref(), plan.messages);
    let input_estimate = estimate_messages_tokens(&history).saturating_add(estimate_text_tokens(&prompt));
    let invocation = AgentInvocation {
        kind,
        session_key: session_key.clone(),
        system_prompt: services.config.system_prompt.clone(),
        prompt: prompt.clone(),
        history,
        provider: provider.clone(),
        model: model.clone(),
        credential,
        sandbox,
        cancel: cancel.clone(),
        live_input,
    };
    let result = invoke_with_grace(services, invocation, &cancel)
        .await
        .map_err(&engine_error)?;
    if cancel.is_cancelled() {
        return Err(engine_error(AgentEngineError::Cancelled));
    }

    let usage = if result.usage == TurnUsage::default() {
        TurnUsage {
            input_tokens: input_estimate,
            output_tokens: estimate_text_tokens(&result.output),
        }
    } else {
        result.usage
    };
    let silent = is_silent_reply(&result.output);

    if kind == InvocationKind::UserTurn {
        let mut messages = vec![user_message(sender_id.as_deref(), &prompt)];
        messages.extend(
            result
                .steered_inputs
                .iter()
                .map(|text| user_message(sender_id.as_deref(), text)),
        );
        messages.push(JournalMessage::assistant_text(result.output.clone()));
        {
            let session_key = session_key.clone();
            services
                .with_journal(move |journal| journal.append_messages(&session_key, &messages))
                .await?;
        }
        services
            .update_index(&session_key, move |entry| {
                entry.record_usage(usage.input_tokens, usage.output_tokens);
                entry.aborted_last_run = false;
                entry.last_run_status = Some(RunStatus::Ok);
            })
            .await?;
    }

    if let Err(error) = services.credentials.mark_success(&profile_id).await {
        tracing::warn!(profile_id = %profile_id, "failed to record auth profile success: {error:#}");
    }

    if tau_context::is_cache_ttl_eligible_provider(&provider, &model) {
        let marker = CacheTtlMarker {
            timestamp: (services.clock)(),
            provider: Some(provider.clone()),
            model: Some(model.clone()),
        };
        let session_key = session_key.clone();
        services
            .with_journal(move |journal| {
                journal.append_custom(&session_key, CACHE_TTL_CUSTOM_TYPE, marker.to_value())
            })
            .await?;
    }

    if kind == InvocationKind::UserTurn && !silent {
        deliver_reply(services, &session_key, run_id, &result.output).await;
    }

    tracing::debug!(
        session_key = %session_key,
        run_id,
        kind = kind.as_str(),
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "agent run completed"
    );
    services.emit(DispatchEvent::RunCompleted {
        session_key,
        run_id,
        output: if kind == InvocationKind::UserTurn {
            result.output
        } else {
            String::new()
        },
        silent,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    });
    Ok(RunOutcome::Completed)
}

async fn resolve_credential(
    services: &RunServices,
    session_key: &str,
    entry: &SessionEntry,
    provider: &str,
) -> Result<ResolvedCredential, RunError> {
    let pin = entry.auth_profile_override().map(|profile_id| ProfilePin {
        profile_id: profile_id.to_string(),
        user: entry.has_user_auth_override(),
    });
    let credential = services
        .credentials
        .resolve_for_provider(provider, pin.as_ref())
        .await
        .map_err(RunError::Credential)?;
    if !entry.has_user_auth_override()
        && entry.auth_profile_override() != Some(credential.profile_id.as_str())
    {
        tracing::debug!(
            session_key = %session_key,
            profile_id = %credential.profile_id,
            "pinning rotated auth profile"
        );
        let profile_id = credential.profile_id.clone();
        services
            .update_index(session_key, move |entry| {
                entry.set_auth_profile_override(profile_id, AuthProfileOverrideSource::Auto);
            })
            .await?;
    }
    Ok(credential)
}

/// Awaits the engine; if cancellation is ignored past the grace period the
/// invocation future is dropped.
async fn invoke_with_grace(
    services: &RunServices,
    invocation: AgentInvocation,
    cancel: &CooperativeCancellationToken,
) -> Result<AgentTurnResult, AgentEngineError> {
    let grace = Duration::from_millis(services.config.cancel_grace_ms);
    let run = services.engine.invoke(invocation);
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("agent engine ignored cancellation for {grace:?}; abandoning invocation");
            Err(AgentEngineError::Cancelled)
        }
    }
}

async fn deliver_reply(services: &RunServices, session_key: &str, run_id: u64, text: &str) {
    let mut receipt = DeliveryReceipt::default();
    if let Some(sink) = &services.reply_sink {
        let reply = OutboundReply {
            session_key: session_key.to_string(),
            run_id,
            text: text.to_string(),
        };
        match sink.deliver(&reply).await {
            Ok(delivered) => receipt = delivered,
            Err(error) => {
                tracing::warn!(session_key = %session_key, run_id, "reply delivery failed: {error:#}");
                return;
            }
        }
    }
    let now = (services.clock)();
    lock_or_recover(&services.sent_messages).record(session_key, &receipt.message_ids, text, now);
}

async fn record_profile_failure(services: &RunServices, profile_id: &str, reason: AuthFailureReason) {
    if let Err(error) = services.credentials.mark_failure(profile_id, reason).await {
        tracing::warn!(profile_id = %profile_id, "failed to record auth profile failure: {error:#}");
    }
}

async fn persist_prompt(
    services: &RunServices,
    session_key: &str,
    sender_id: Option<&str>,
    prompt: &str,
) {
    if prompt.trim().is_empty() {
        return;
    }
    let key = session_key.to_string();
    let message = user_message(sender_id, prompt);
    let appended = services
        .with_journal(move |journal| journal.append_messages(&key, &[message]))
        .await;
    if let Err(error) = appended {
        tracing::warn!(session_key = %session_key, "failed to journal prompt: {error:#}");
    }
}

async fn update_entry(
    services: &RunServices,
    session_key: &str,
    mutate: impl FnOnce(&mut SessionEntry) + Send + 'static,
) {
    if let Err(error) = services.update_index(session_key, mutate).await {
        tracing::warn!(session_key = %session_key, "failed to update session entry: {error:#}");
    }
}

fn user_message(sender_id: Option<&str>, text: &str) -> JournalMessage {
    match sender_id {
        Some(sender_id) => JournalMessage::user_from(sender_id, text),
        None => JournalMessage::user(text),
    }
}

fn summary_message_tokens(summary: Option<&str>) -> u64 {
    estimate_messages_tokens(&with_summary(summary, Vec::new()))
}

fn with_summary(summary: Option<&str>, history: Vec<JournalMessage>) -> Vec<JournalMessage> {
    match summary {
        Some(summary) => {
            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(JournalMessage::system(format!(
                "Summary of earlier conversation: {summary}"
            )));
            messages.extend(history);
            messages
        }
        None => history,
    }
}

fn reported_or_estimated_output(result: &AgentTurnResult) -> u64 {
    if result.usage.output_tokens > 0 {
        result.usage.output_tokens
    } else {
        estimate_text_tokens(&result.output)
    }
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
