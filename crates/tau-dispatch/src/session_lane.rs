//! Per-session actor: owns the debounce buffers, the pending queue and the
//! single active run for one session key.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent_engine::InvocationKind;
use crate::cancellation::CooperativeCancellationToken;
use crate::dispatch_events::DispatchEvent;
use crate::governed_run::{
    execute_governed_run, lock_or_recover, RunOutcome, RunRequest, RunServices,
};
use crate::pending_queue::{merge_collected, PendingItem, PendingQueue, PushOutcome};
use crate::queue_settings::{QueueMode, QueueSettings, QueueSettingsOverride};

const LIVE_INPUT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundItem {
    pub sender_id: String,
    pub message_id: String,
    pub content: String,
    pub arrival_ms: u64,
}

pub(crate) enum LaneCommand {
    Inbound(InboundItem),
    Abort,
    SetQueueOverride(Option<QueueSettingsOverride>),
    KeepCacheWarm,
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct LaneHandle {
    pub commands: mpsc::UnboundedSender<LaneCommand>,
    pub task: JoinHandle<()>,
    pub generation: u64,
}

/// Live lanes by session key. Senders hold the lock while sending so a lane
/// retiring under the same lock never drops a queued command.
pub(crate) type LaneRegistry = Arc<Mutex<HashMap<String, LaneHandle>>>;

struct RunDone {
    run_id: u64,
    outcome: RunOutcome,
}

struct ActiveRun {
    run_id: u64,
    kind: InvocationKind,
    prompt: String,
    cancel: CooperativeCancellationToken,
    live_input: Option<mpsc::Sender<String>>,
    steer_window_closed: bool,
}

struct DebounceBuffer {
    parts: Vec<String>,
    message_ids: Vec<String>,
    first_arrival_ms: u64,
    deadline: Instant,
}

pub(crate) struct SessionLane {
    session_key: String,
    services: Arc<RunServices>,
    base_settings: QueueSettings,
    queue_override: Option<QueueSettingsOverride>,
    run_ids: Arc<AtomicU64>,
    registry: LaneRegistry,
    generation: u64,
    commands: mpsc::UnboundedReceiver<LaneCommand>,
    commands_closed: bool,
    run_done_tx: mpsc::UnboundedSender<RunDone>,
    run_done_rx: mpsc::UnboundedReceiver<RunDone>,
    debounce: HashMap<String, DebounceBuffer>,
    active: Option<ActiveRun>,
    pending: PendingQueue,
    pending_interrupt: Option<PendingItem>,
    deferred_retry: Option<String>,
    shutdown_acks: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl SessionLane {
    pub(crate) fn new(
        session_key: String,
        services: Arc<RunServices>,
        base_settings: QueueSettings,
        queue_override: Option<QueueSettingsOverride>,
        run_ids: Arc<AtomicU64>,
        registry: LaneRegistry,
        generation: u64,
        commands: mpsc::UnboundedReceiver<LaneCommand>,
    ) -> Self {
        let (run_done_tx, run_done_rx) = mpsc::unbounded_channel();
        Self {
            session_key,
            services,
            base_settings,
            queue_override,
            run_ids,
            registry,
            generation,
            commands,
            commands_closed: false,
            run_done_tx,
            run_done_rx,
            debounce: HashMap::new(),
            active: None,
            pending: PendingQueue::default(),
            pending_interrupt: None,
            deferred_retry: None,
            shutdown_acks: Vec::new(),
            shutting_down: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let idle_grace = Duration::from_millis(self.services.config.lane_idle_ms);
        loop {
            let next_deadline = self.debounce.values().map(|buffer| buffer.deadline).min();
            let idle = self.is_idle();
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.commands_closed = true;
                        self.begin_shutdown();
                    }
                },
                Some(done) = self.run_done_rx.recv() => self.handle_run_done(done),
                _ = wait_for_deadline(next_deadline) => self.flush_due_debounce(),
                _ = tokio::time::sleep(idle_grace), if idle => {
                    if self.try_retire() {
                        tracing::debug!(session_key = %self.session_key, "idle session lane retired");
                        return;
                    }
                }
            }
            if self.shutting_down && self.active.is_none() {
                break;
            }
        }
        tracing::debug!(session_key = %self.session_key, "session lane stopped");
        for ack in self.shutdown_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn is_idle(&self) -> bool {
        !self.shutting_down
            && !self.commands_closed
            && self.active.is_none()
            && self.pending.is_empty()
            && self.pending_interrupt.is_none()
            && self.deferred_retry.is_none()
            && self.debounce.is_empty()
    }

    /// Removes this lane from the registry when no command slipped in while
    /// the idle timer was running. Returns true when the lane should exit.
    fn try_retire(&mut self) -> bool {
        let registry = Arc::clone(&self.registry);
        let mut lanes = lock_or_recover(&registry);
        match self.commands.try_recv() {
            Ok(command) => {
                drop(lanes);
                self.handle_command(command);
                false
            }
            Err(TryRecvError::Empty) => {
                if lanes
                    .get(&self.session_key)
                    .is_some_and(|lane| lane.generation == self.generation)
                {
                    lanes.remove(&self.session_key);
                }
                true
            }
            Err(TryRecvError::Disconnected) => {
                drop(lanes);
                self.commands_closed = true;
                self.begin_shutdown();
                false
            }
        }
    }

    fn settings(&self) -> QueueSettings {
        match &self.queue_override {
            Some(overrides) => self.base_settings.with_override(overrides),
            None => self.base_settings,
        }
    }

    fn handle_command(&mut self, command: LaneCommand) {
        match command {
            LaneCommand::Inbound(item) => self.handle_inbound(item),
            LaneCommand::Abort => self.abort(),
            LaneCommand::SetQueueOverride(overrides) => {
                self.queue_override = overrides;
                tracing::debug!(
                    session_key = %self.session_key,
                    mode = self.settings().mode.as_str(),
                    "queue override updated"
                );
            }
            LaneCommand::KeepCacheWarm => self.keep_cache_warm(),
            LaneCommand::Shutdown(ack) => {
                self.shutdown_acks.push(ack);
                self.begin_shutdown();
            }
        }
    }

    fn handle_inbound(&mut self, item: InboundItem) {
        if self.shutting_down {
            tracing::warn!(session_key = %self.session_key, "dropping inbound message during shutdown");
            return;
        }
        let debounce_ms = self.settings().debounce_ms;
        if debounce_ms == 0 {
            self.accept(PendingItem {
                sender_id: item.sender_id,
                message_ids: vec![item.message_id],
                content: item.content,
                arrival_ms: item.arrival_ms,
                condensed: false,
            });
            return;
        }
        let deadline = Instant::now() + Duration::from_millis(debounce_ms);
        let buffer = self
            .debounce
            .entry(item.sender_id)
            .or_insert_with(|| DebounceBuffer {
                parts: Vec::new(),
                message_ids: Vec::new(),
                first_arrival_ms: item.arrival_ms,
                deadline,
            });
        buffer.parts.push(item.content);
        buffer.message_ids.push(item.message_id);
        buffer.deadline = deadline;
    }

    fn flush_due_debounce(&mut self) {
        let now = Instant::now();
        let mut due = self
            .debounce
            .iter()
            .filter(|(_, buffer)| buffer.deadline <= now)
            .map(|(sender_id, buffer)| (buffer.first_arrival_ms, sender_id.clone()))
            .collect::<Vec<_>>();
        due.sort();
        for (_, sender_id) in due {
            let Some(buffer) = self.debounce.remove(&sender_id) else {
                continue;
            };
            let merged = buffer.parts.len();
            if merged > 1 {
                self.services.emit(DispatchEvent::Debounced {
                    session_key: self.session_key.clone(),
                    sender_id: sender_id.clone(),
                    merged,
                });
            }
            self.accept(PendingItem {
                sender_id,
                message_ids: buffer.message_ids,
                content: buffer.parts.join("\n"),
                arrival_ms: buffer.first_arrival_ms,
                condensed: false,
            });
        }
    }

    /// Entry point of the state machine for a released item.
    fn accept(&mut self, item: PendingItem) {
        let settings = self.settings();
        let Some(active) = self.active.as_mut() else {
            self.start_user_run(item, 1);
            return;
        };
        match settings.mode {
            QueueMode::Interrupt => {
                tracing::info!(
                    session_key = %self.session_key,
                    run_id = active.run_id,
                    "interrupting active run"
                );
                active.cancel.cancel();
                if self.pending_interrupt.replace(item).is_some() {
                    self.services.emit(DispatchEvent::Superseded {
                        session_key: self.session_key.clone(),
                    });
                }
            }
            QueueMode::Steer => {
                if !try_steer(active, &item.content) {
                    self.buffer(item, &settings);
                    return;
                }
                let run_id = active.run_id;
                self.emit_steered(run_id);
            }
            QueueMode::SteerBacklog => {
                if active.steer_window_closed || !try_steer(active, &item.content) {
                    active.steer_window_closed = true;
                    self.buffer(item, &settings);
                    return;
                }
                let run_id = active.run_id;
                self.emit_steered(run_id);
            }
            QueueMode::Followup | QueueMode::Collect | QueueMode::Queue => {
                self.buffer(item, &settings);
            }
        }
    }

    fn emit_steered(&self, run_id: u64) {
        tracing::debug!(session_key = %self.session_key, run_id, "steered message into active run");
        self.services.emit(DispatchEvent::Steered {
            session_key: self.session_key.clone(),
            run_id,
        });
    }

    fn buffer(&mut self, item: PendingItem, settings: &QueueSettings) {
        let session_key = self.session_key.clone();
        match self.pending.push(item, settings) {
            PushOutcome::Accepted => self.services.emit(DispatchEvent::Buffered {
                session_key,
                mode: settings.mode.as_str(),
                depth: self.pending.len(),
            }),
            PushOutcome::DroppedOldest(dropped) => {
                tracing::info!(session_key = %session_key, dropped, "queue full, dropped oldest");
                self.services.emit(DispatchEvent::Dropped {
                    session_key,
                    policy: settings.drop_policy.as_str(),
                    dropped,
                });
            }
            PushOutcome::RefusedIncoming => {
                tracing::info!(session_key = %session_key, "queue full, refused incoming message");
                self.services.emit(DispatchEvent::Dropped {
                    session_key,
                    policy: settings.drop_policy.as_str(),
                    dropped: 1,
                });
            }
            PushOutcome::Summarized(condensed) => {
                tracing::info!(session_key = %session_key, condensed, "queue full, condensed backlog");
                self.services.emit(DispatchEvent::Summarized {
                    session_key,
                    condensed,
                });
            }
            PushOutcome::OverCap => {
                tracing::warn!(
                    session_key = %session_key,
                    depth = self.pending.len(),
                    cap = settings.cap,
                    "queue depth exceeds cap"
                );
                self.services.emit(DispatchEvent::QueueOverCap {
                    session_key,
                    depth: self.pending.len(),
                    cap: settings.cap,
                });
            }
        }
    }

    fn handle_run_done(&mut self, done: RunDone) {
        let Some(active) = self.active.take_if_run(done.run_id) else {
            return;
        };
        if let RunOutcome::Failed {
            retryable: true, ..
        } = done.outcome
        {
            tracing::info!(
                session_key = %self.session_key,
                run_id = done.run_id,
                "deferring failed prompt to the next run"
            );
            self.deferred_retry = Some(active.prompt);
        }
        if self.shutting_down {
            return;
        }
        self.start_next();
    }

    fn start_next(&mut self) {
        if let Some(item) = self.pending_interrupt.take() {
            self.start_user_run(item, 1);
            return;
        }
        if self.pending.is_empty() {
            return;
        }
        if self.settings().mode == QueueMode::Collect {
            let items = self.pending.drain_all();
            let count = items.len();
            if let Some(merged) = merge_collected(items) {
                self.start_user_run(merged, count);
            }
            return;
        }
        if let Some(item) = self.pending.pop_front() {
            self.start_user_run(item, 1);
        }
    }

    fn start_user_run(&mut self, item: PendingItem, merged_items: usize) {
        let prompt = match self.deferred_retry.take() {
            Some(deferred) => format!("{deferred}\n\n{}", item.content),
            None => item.content,
        };
        self.start_run(InvocationKind::UserTurn, prompt, Some(item.sender_id), merged_items);
    }

    fn start_run(
        &mut self,
        kind: InvocationKind,
        prompt: String,
        sender_id: Option<String>,
        merged_items: usize,
    ) {
        let run_id = self.run_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CooperativeCancellationToken::new();
        let (live_tx, live_rx) =
            if kind == InvocationKind::UserTurn && self.services.engine.supports_live_input() {
                let (tx, rx) = mpsc::channel(LIVE_INPUT_CAPACITY);
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
        tracing::debug!(
            session_key = %self.session_key,
            run_id,
            kind = kind.as_str(),
            merged_items,
            "starting agent run"
        );
        self.services.emit(DispatchEvent::RunStarted {
            session_key: self.session_key.clone(),
            run_id,
            kind: kind.as_str(),
            merged_items,
        });
        self.active = Some(ActiveRun {
            run_id,
            kind,
            prompt: prompt.clone(),
            cancel: cancel.clone(),
            live_input: live_tx,
            steer_window_closed: false,
        });

        let request = RunRequest {
            run_id,
            session_key: self.session_key.clone(),
            kind,
            prompt,
            sender_id,
            cancel,
            live_input: live_rx,
        };
        let services = Arc::clone(&self.services);
        let done = self.run_done_tx.clone();
        tokio::spawn(async move {
            let outcome = execute_governed_run(&services, request).await;
            let _ = done.send(RunDone { run_id, outcome });
        });
    }

    fn abort(&mut self) {
        let mut cleared = self.pending.clear();
        if self.pending_interrupt.take().is_some() {
            cleared += 1;
        }
        cleared += self.debounce.drain().count();
        self.deferred_retry = None;
        if let Some(active) = &self.active {
            tracing::info!(
                session_key = %self.session_key,
                run_id = active.run_id,
                kind = active.kind.as_str(),
                "aborting active run"
            );
            active.cancel.cancel();
        }
        self.services.emit(DispatchEvent::Aborted {
            session_key: self.session_key.clone(),
            cleared,
        });
    }

    fn keep_cache_warm(&mut self) {
        if self.shutting_down || self.active.is_some() {
            tracing::debug!(session_key = %self.session_key, "skipping cache keepalive, lane busy");
            return;
        }
        self.start_run(InvocationKind::CacheKeepalive, String::new(), None, 0);
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let dropped = self.pending.clear()
            + usize::from(self.pending_interrupt.take().is_some())
            + self.debounce.drain().count();
        if dropped > 0 {
            tracing::warn!(session_key = %self.session_key, dropped, "discarding buffered messages on shutdown");
        }
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

trait TakeActiveRun {
    fn take_if_run(&mut self, run_id: u64) -> Option<ActiveRun>;
}

impl TakeActiveRun for Option<ActiveRun> {
    fn take_if_run(&mut self, run_id: u64) -> Option<ActiveRun> {
        if self.as_ref().map(|active| active.run_id) == Some(run_id) {
            self.take()
        } else {
            None
        }
    }
}

/// Sends `content` into the run's live input; a closed or full channel
/// disables steering for the rest of the run.
fn try_steer(active: &mut ActiveRun, content: &str) -> bool {
    let Some(live_input) = &active.live_input else {
        return false;
    };
    if live_input.try_send(content.to_string()).is_ok() {
        return true;
    }
    active.live_input = None;
    false
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
