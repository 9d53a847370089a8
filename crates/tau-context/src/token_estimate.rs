use serde_json::Value;
use tau_session::{ContentBlock, JournalMessage};

const MESSAGE_OVERHEAD_TOKENS: u64 = 4;
const TOOL_CALL_OVERHEAD_TOKENS: u64 = 4;

/// Roughly four characters per token, rounded up.
pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
    chars.saturating_add(3) / 4
}

pub fn estimate_message_tokens(message: &JournalMessage) -> u64 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => {
                total = total.saturating_add(estimate_text_tokens(text));
            }
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => {
                total = total.saturating_add(estimate_text_tokens(id));
                total = total.saturating_add(estimate_text_tokens(name));
                total = total.saturating_add(estimate_json_tokens(arguments));
                total = total.saturating_add(TOOL_CALL_OVERHEAD_TOKENS);
            }
            ContentBlock::ToolResult {
                tool_call_id, text, ..
            } => {
                total = total.saturating_add(estimate_text_tokens(tool_call_id));
                total = total.saturating_add(estimate_text_tokens(text));
            }
        }
    }
    if let Some(sender_id) = &message.sender_id {
        total = total.saturating_add(estimate_text_tokens(sender_id));
    }
    total
}

pub fn estimate_messages_tokens(messages: &[JournalMessage]) -> u64 {
    messages.iter().fold(0u64, |acc, message| {
        acc.saturating_add(estimate_message_tokens(message))
    })
}

fn estimate_json_tokens(value: &Value) -> u64 {
    let rendered = serde_json::to_string(value).unwrap_or_else(|_| value.to_string());
    estimate_text_tokens(&rendered)
}
