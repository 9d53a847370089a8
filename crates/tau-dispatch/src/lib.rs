//! Inbound dispatch for the Tau gateway.
//!
//! Channel adapters hand every inbound message to [`InboundDispatcher::enqueue`].
//! Echoes of our own replies and redelivered events are dropped first, then
//! each session key gets a lane that debounces bursts per sender, applies the
//! session's queue mode while a run is active, and drives governed agent runs
//! one at a time.

mod agent_engine;
mod cancellation;
mod dedupe;
mod dispatch_events;
mod dispatcher;
mod governed_run;
mod pending_queue;
mod queue_settings;
mod reply_sink;
mod sent_message_cache;
mod session_key;
mod session_lane;
#[cfg(test)]
mod tests;

pub use agent_engine::{
    AgentEngine, AgentEngineError, AgentInvocation, AgentTurnResult, InvocationKind, TurnUsage,
};
pub use cancellation::CooperativeCancellationToken;
pub use dedupe::{InboundDedupeTracker, DEFAULT_DEDUPE_CAPACITY};
pub use dispatch_events::{DispatchEvent, DispatchEventSink};
pub use dispatcher::{
    DispatcherConfig, DispatcherDependencies, EnqueueOutcome, InboundDispatcher, DEFAULT_AGENT_ID,
    DEFAULT_CANCEL_GRACE_MS, DEFAULT_LANE_IDLE_MS, DEFAULT_MODEL, DEFAULT_PROVIDER,
};
pub use pending_queue::{merge_collected, PendingItem, PendingQueue, PushOutcome};
pub use queue_settings::{
    DedupeMode, DropPolicy, QueueConfig, QueueMode, QueueSettings, QueueSettingsOverride,
    DEFAULT_DEBOUNCE_MS, DEFAULT_QUEUE_CAP,
};
pub use reply_sink::{DeliveryReceipt, OutboundReply, ReplySink};
pub use sent_message_cache::{
    SentMessageCache, DEFAULT_SENT_MESSAGE_SWEEP_THRESHOLD, DEFAULT_SENT_MESSAGE_TTL_MS,
};
pub use session_key::{main_session_key, parse_session_key, resolve_session_key, SessionKeyParts};
