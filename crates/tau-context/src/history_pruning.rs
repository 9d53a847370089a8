//! Chunked, oldest-first pruning of message history against a token budget.
use serde::Serialize;
use tau_session::JournalMessage;

use crate::token_estimate::{estimate_message_tokens, estimate_messages_tokens};

pub const DEFAULT_PRUNE_PARTS: usize = 2;
pub const DEFAULT_MAX_HISTORY_SHARE: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Outcome of `prune_history_for_context_share`.
pub struct HistoryPruneResult {
    pub messages: Vec<JournalMessage>,
    pub dropped_messages_list: Vec<JournalMessage>,
    pub dropped_chunks: usize,
    pub dropped_messages: usize,
    pub dropped_tokens: u64,
    pub kept_tokens: u64,
    pub budget_tokens: u64,
}

fn normalize_parts(parts: usize, message_count: usize) -> usize {
    if parts <= 1 {
        return 1;
    }
    parts.min(message_count.max(1))
}

/// Splits `messages` into at most `parts` contiguous chunks of roughly equal
/// estimated token mass. Concatenating the chunks yields the input.
pub fn split_messages_by_token_share(
    messages: &[JournalMessage],
    parts: usize,
) -> Vec<Vec<JournalMessage>> {
    if messages.is_empty() {
        return Vec::new();
    }
    let parts = normalize_parts(parts, messages.len());
    if parts <= 1 {
        return vec![messages.to_vec()];
    }

    let total_tokens = estimate_messages_tokens(messages);
    let target_tokens = total_tokens as f64 / parts as f64;
    let mut chunks: Vec<Vec<JournalMessage>> = Vec::with_capacity(parts);
    let mut current: Vec<JournalMessage> = Vec::new();
    let mut current_tokens = 0u64;

    for message in messages {
        let message_tokens = estimate_message_tokens(message);
        if chunks.len() < parts - 1
            && !current.is_empty()
            && (current_tokens + message_tokens) as f64 > target_tokens
        {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(message.clone());
        current_tokens = current_tokens.saturating_add(message_tokens);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Drops the oldest chunk while history exceeds
/// `floor(max_context_tokens * max_history_share)`.
///
/// The remaining history is re-split after every drop, and the newest chunk
/// is never dropped, so the most recent turn always survives.
pub fn prune_history_for_context_share(
    messages: &[JournalMessage],
    max_context_tokens: u64,
    max_history_share: f64,
    parts: usize,
) -> HistoryPruneResult {
    let share = if max_history_share.is_finite() && max_history_share > 0.0 {
        max_history_share
    } else {
        DEFAULT_MAX_HISTORY_SHARE
    };
    let budget_tokens = ((max_context_tokens as f64 * share).floor() as u64).max(1);

    let mut kept: Vec<JournalMessage> = messages.to_vec();
    let mut dropped_messages_list: Vec<JournalMessage> = Vec::new();
    let mut dropped_chunks = 0usize;
    let mut dropped_tokens = 0u64;

    while !kept.is_empty() && estimate_messages_tokens(&kept) > budget_tokens {
        let mut chunks = split_messages_by_token_share(&kept, parts);
        if chunks.len() <= 1 {
            break;
        }
        let dropped = chunks.remove(0);
        dropped_chunks += 1;
        dropped_tokens = dropped_tokens.saturating_add(estimate_messages_tokens(&dropped));
        dropped_messages_list.extend(dropped);
        kept = chunks.into_iter().flatten().collect();
    }

    if dropped_chunks > 0 {
        tracing::debug!(
            dropped_chunks,
            dropped_messages = dropped_messages_list.len(),
            dropped_tokens,
            budget_tokens,
            "pruned history to fit context share"
        );
    }

    HistoryPruneResult {
        kept_tokens: estimate_messages_tokens(&kept),
        dropped_messages: dropped_messages_list.len(),
        messages: kept,
        dropped_messages_list,
        dropped_chunks,
        dropped_tokens,
        budget_tokens,
    }
}
