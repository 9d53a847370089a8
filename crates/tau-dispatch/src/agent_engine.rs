use async_trait::async_trait;
use serde::Serialize;
use tau_provider::{AuthFailureReason, ResolvedCredential};
use tau_sandbox::SandboxContext;
use tau_session::JournalMessage;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cancellation::CooperativeCancellationToken;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `InvocationKind` values.
pub enum InvocationKind {
    UserTurn,
    MemoryFlush,
    CacheKeepalive,
}

impl InvocationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationKind::UserTurn => "user_turn",
            InvocationKind::MemoryFlush => "memory_flush",
            InvocationKind::CacheKeepalive => "cache_keepalive",
        }
    }
}

/// Everything the agent engine needs for one invocation.
pub struct AgentInvocation {
    pub kind: InvocationKind,
    pub session_key: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub history: Vec<JournalMessage>,
    pub provider: String,
    pub model: String,
    pub credential: ResolvedCredential,
    pub sandbox: SandboxContext,
    pub cancel: CooperativeCancellationToken,
    /// Present only when the engine reports `supports_live_input`.
    pub live_input: Option<mpsc::Receiver<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Public struct `TurnUsage` used across Tau components.
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `AgentTurnResult` used across Tau components.
pub struct AgentTurnResult {
    pub output: String,
    pub usage: TurnUsage,
    pub stop_reason: Option<String>,
    /// Live-input messages the engine consumed during the run, in order.
    pub steered_inputs: Vec<String>,
}

impl AgentTurnResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `AgentEngineError` values.
pub enum AgentEngineError {
    #[error("provider request failed ({reason}): {message}")]
    Provider {
        reason: AuthFailureReason,
        message: String,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("agent engine error: {0}")]
    Other(String),
}

/// Seam to the agent runtime that executes one turn.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Whether running invocations can accept steered messages.
    fn supports_live_input(&self) -> bool {
        false
    }

    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentTurnResult, AgentEngineError>;
}
