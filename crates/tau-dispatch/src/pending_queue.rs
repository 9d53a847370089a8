//! Buffered inbound items for a session while a run is active.
use std::collections::VecDeque;

use serde::Serialize;

use crate::queue_settings::{DropPolicy, QueueMode, QueueSettings};

const CONDENSED_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// One released (post-debounce) inbound item.
pub struct PendingItem {
    pub sender_id: String,
    pub message_ids: Vec<String>,
    pub content: String,
    pub arrival_ms: u64,
    /// Set on the entry produced by the summarize drop policy.
    pub condensed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of offering an item to a full or non-full buffer.
pub enum PushOutcome {
    Accepted,
    DroppedOldest(usize),
    RefusedIncoming,
    Summarized(usize),
    /// Accepted past the cap; `queue` mode only warns.
    OverCap,
}

#[derive(Debug, Clone, Default)]
/// Public struct `PendingQueue` used across Tau components.
pub struct PendingQueue {
    items: VecDeque<PendingItem>,
}

impl PendingQueue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        cleared
    }

    pub fn push(&mut self, item: PendingItem, settings: &QueueSettings) -> PushOutcome {
        let cap = settings.cap.max(1);
        if self.items.len() < cap {
            self.items.push_back(item);
            return PushOutcome::Accepted;
        }
        if settings.mode == QueueMode::Queue {
            self.items.push_back(item);
            return PushOutcome::OverCap;
        }
        match settings.drop_policy {
            DropPolicy::Old => {
                let mut dropped = 0;
                while self.items.len() >= cap {
                    self.items.pop_front();
                    dropped += 1;
                }
                self.items.push_back(item);
                PushOutcome::DroppedOldest(dropped)
            }
            DropPolicy::New => PushOutcome::RefusedIncoming,
            DropPolicy::Summarize => {
                let mut buffered = self.items.drain(..).collect::<Vec<_>>();
                let condensed_count = buffered.len();
                if cap == 1 {
                    buffered.push(item);
                    self.items.push_back(condense(buffered));
                } else {
                    self.items.push_back(condense(buffered));
                    self.items.push_back(item);
                }
                PushOutcome::Summarized(condensed_count)
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<PendingItem> {
        self.items.pop_front()
    }

    pub fn drain_all(&mut self) -> Vec<PendingItem> {
        self.items.drain(..).collect()
    }
}

/// Merges items into one prompt, preserving arrival order.
pub fn merge_collected(items: Vec<PendingItem>) -> Option<PendingItem> {
    if items.len() <= 1 {
        return items.into_iter().next();
    }
    let mut content = String::from("[Queued messages while the agent was busy]");
    for (index, item) in items.iter().enumerate() {
        content.push_str(&format!(
            "\n\n---\nQueued #{} (from {})\n{}",
            index + 1,
            item.sender_id,
            item.content
        ));
    }
    Some(PendingItem {
        sender_id: items
            .last()
            .map(|item| item.sender_id.clone())
            .unwrap_or_default(),
        message_ids: items
            .iter()
            .flat_map(|item| item.message_ids.iter().cloned())
            .collect(),
        content,
        arrival_ms: items.first().map(|item| item.arrival_ms).unwrap_or_default(),
        condensed: items.iter().any(|item| item.condensed),
    })
}

fn condense(items: Vec<PendingItem>) -> PendingItem {
    let mut lines = Vec::new();
    let mut total = 0usize;
    for item in &items {
        if item.condensed {
            // Fold an earlier summary in as-is; its header is dropped.
            lines.extend(item.content.lines().skip(1).map(str::to_string));
            total += condensed_count(&item.content);
        } else {
            lines.push(format!("- {}: {}", item.sender_id, preview(&item.content)));
            total += 1;
        }
    }
    PendingItem {
        sender_id: items
            .last()
            .map(|item| item.sender_id.clone())
            .unwrap_or_default(),
        message_ids: items
            .iter()
            .flat_map(|item| item.message_ids.iter().cloned())
            .collect(),
        content: format!(
            "[{total} earlier queued message(s) condensed]\n{}",
            lines.join("\n")
        ),
        arrival_ms: items.first().map(|item| item.arrival_ms).unwrap_or_default(),
        condensed: true,
    }
}

fn condensed_count(content: &str) -> usize {
    content
        .strip_prefix('[')
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|count| count.parse().ok())
        .unwrap_or(1)
}

fn preview(content: &str) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= CONDENSED_PREVIEW_CHARS {
        return flattened;
    }
    let mut clipped = flattened
        .chars()
        .take(CONDENSED_PREVIEW_CHARS)
        .collect::<String>();
    clipped.push('…');
    clipped
}
