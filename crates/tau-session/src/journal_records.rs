//! Record types persisted one-per-line in a session journal.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// One block of message content.
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        text: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A conversation message as stored in the journal and handed to the agent engine.
pub struct JournalMessage {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl JournalMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn user_from(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id.into()),
            ..Self::text(MessageRole::User, text)
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, text)
    }

    fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            sender_id: None,
        }
    }

    /// Concatenates text and tool-result blocks, newline separated.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolResult { text, .. } => Some(text.as_str()),
                ContentBlock::ToolCall { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// First record of every journal file.
pub struct SessionHeader {
    pub version: u32,
    pub id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    pub timestamp: u64,
    pub message: JournalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Free-form marker entry, e.g. the prompt-cache TTL timestamp.
pub struct CustomRecord {
    pub id: u64,
    pub custom_type: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Marks a history prune; the context view restarts at `first_kept_entry_id`.
pub struct CompactionRecord {
    pub id: u64,
    pub timestamp: u64,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_kept_entry_id: Option<u64>,
    pub tokens_before: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `JournalRecord` values.
pub enum JournalRecord {
    Session(SessionHeader),
    Message(MessageRecord),
    Custom(CustomRecord),
    Compaction(CompactionRecord),
}

impl JournalRecord {
    /// Entry id for non-header records.
    pub fn entry_id(&self) -> Option<u64> {
        match self {
            JournalRecord::Session(_) => None,
            JournalRecord::Message(record) => Some(record.id),
            JournalRecord::Custom(record) => Some(record.id),
            JournalRecord::Compaction(record) => Some(record.id),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            JournalRecord::Session(header) => header.timestamp,
            JournalRecord::Message(record) => record.timestamp,
            JournalRecord::Custom(record) => record.timestamp,
            JournalRecord::Compaction(record) => record.timestamp,
        }
    }
}

/// Returns true when a raw JSON line is a well-formed session header.
pub fn is_session_header(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("session")
        && value
            .get("id")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.trim().is_empty())
}
