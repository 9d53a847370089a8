use std::sync::Arc;

use serde::Serialize;

/// Observer for dispatcher lifecycle events.
pub type DispatchEventSink = Arc<dyn Fn(&DispatchEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
/// Enumerates supported `DispatchEvent` values.
pub enum DispatchEvent {
    Deduplicated {
        session_key: String,
        message_id: String,
    },
    EchoSuppressed {
        session_key: String,
        sender_id: String,
    },
    Debounced {
        session_key: String,
        sender_id: String,
        merged: usize,
    },
    Buffered {
        session_key: String,
        mode: &'static str,
        depth: usize,
    },
    Dropped {
        session_key: String,
        policy: &'static str,
        dropped: usize,
    },
    Summarized {
        session_key: String,
        condensed: usize,
    },
    QueueOverCap {
        session_key: String,
        depth: usize,
        cap: usize,
    },
    Superseded {
        session_key: String,
    },
    Steered {
        session_key: String,
        run_id: u64,
    },
    RunStarted {
        session_key: String,
        run_id: u64,
        kind: &'static str,
        merged_items: usize,
    },
    JournalRepaired {
        session_key: String,
        dropped_lines: usize,
    },
    MemoryFlushed {
        session_key: String,
        run_id: u64,
        tokens: u64,
    },
    HistoryPruned {
        session_key: String,
        run_id: u64,
        dropped_messages: usize,
        dropped_tokens: u64,
    },
    RunCompleted {
        session_key: String,
        run_id: u64,
        output: String,
        silent: bool,
        input_tokens: u64,
        output_tokens: u64,
    },
    RunCancelled {
        session_key: String,
        run_id: u64,
    },
    RunFailed {
        session_key: String,
        run_id: u64,
        reason: &'static str,
        retryable: bool,
        message: String,
    },
    CacheKeepaliveSkipped {
        session_key: String,
    },
    OperatorHint {
        session_key: String,
        message: String,
    },
    Aborted {
        session_key: String,
        cleared: usize,
    },
}

impl DispatchEvent {
    pub fn session_key(&self) -> &str {
        match self {
            DispatchEvent::Deduplicated { session_key, .. }
            | DispatchEvent::EchoSuppressed { session_key, .. }
            | DispatchEvent::Debounced { session_key, .. }
            | DispatchEvent::Buffered { session_key, .. }
            | DispatchEvent::Dropped { session_key, .. }
            | DispatchEvent::Summarized { session_key, .. }
            | DispatchEvent::QueueOverCap { session_key, .. }
            | DispatchEvent::Superseded { session_key }
            | DispatchEvent::Steered { session_key, .. }
            | DispatchEvent::RunStarted { session_key, .. }
            | DispatchEvent::JournalRepaired { session_key, .. }
            | DispatchEvent::MemoryFlushed { session_key, .. }
            | DispatchEvent::HistoryPruned { session_key, .. }
            | DispatchEvent::RunCompleted { session_key, .. }
            | DispatchEvent::RunCancelled { session_key, .. }
            | DispatchEvent::RunFailed { session_key, .. }
            | DispatchEvent::CacheKeepaliveSkipped { session_key }
            | DispatchEvent::OperatorHint { session_key, .. }
            | DispatchEvent::Aborted { session_key, .. } => session_key,
        }
    }
}

pub(crate) fn emit(sink: Option<&DispatchEventSink>, event: DispatchEvent) {
    if let Some(sink) = sink {
        sink(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchEvent;

    #[test]
    fn unit_events_serialize_with_event_tag() {
        let value = serde_json::to_value(DispatchEvent::Dropped {
            session_key: "agent:a:b:c:d".to_string(),
            policy: "old",
            dropped: 2,
        })
        .expect("serialize");
        assert_eq!(value["event"], "dropped");
        assert_eq!(value["policy"], "old");
        assert_eq!(value["dropped"], 2);
    }
}
