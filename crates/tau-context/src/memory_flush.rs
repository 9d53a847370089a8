//! Pre-compaction memory flush: decide when to run it and what to ask.
use serde::{Deserialize, Serialize};
use tau_session::SessionEntry;

/// Reply text meaning "nothing to deliver".
pub const SILENT_REPLY_TOKEN: &str = "NO_REPLY";
pub const DEFAULT_MEMORY_FLUSH_SOFT_THRESHOLD_TOKENS: u64 = 4_000;

const DEFAULT_MEMORY_FLUSH_PROMPT: &str = "Pre-compaction memory flush. Older conversation history is about to be pruned. \
Write anything worth keeping to durable memory now (for example memory/YYYY-MM-DD.md). \
If there is nothing to store, reply with";

const DEFAULT_MEMORY_FLUSH_SYSTEM_PROMPT: &str = "This is a memory flush turn: the session is close to its context limit. \
Persist durable notes with your tools; a user-facing reply is usually unnecessary.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MemoryFlushSettings {
    pub enabled: bool,
    pub soft_threshold_tokens: u64,
    pub prompt: String,
    pub system_prompt: String,
}

impl Default for MemoryFlushSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_threshold_tokens: DEFAULT_MEMORY_FLUSH_SOFT_THRESHOLD_TOKENS,
            prompt: DEFAULT_MEMORY_FLUSH_PROMPT.to_string(),
            system_prompt: DEFAULT_MEMORY_FLUSH_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl MemoryFlushSettings {
    /// The flush prompt, always ending with the silent-reply sentinel.
    pub fn flush_prompt(&self) -> String {
        ensure_silent_reply_suffix(&self.prompt)
    }

    pub fn flush_system_prompt(&self) -> String {
        ensure_silent_reply_suffix(&self.system_prompt)
    }
}

fn ensure_silent_reply_suffix(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.ends_with(SILENT_REPLY_TOKEN) {
        return trimmed.to_string();
    }
    if trimmed.is_empty() {
        return SILENT_REPLY_TOKEN.to_string();
    }
    format!("{trimmed} {SILENT_REPLY_TOKEN}")
}

/// True when the whole reply is the silent sentinel.
pub fn is_silent_reply(text: &str) -> bool {
    text.trim() == SILENT_REPLY_TOKEN
}

/// Returns true iff the session is within `soft_threshold_tokens` of the
/// reserve boundary and has not been flushed for its current compaction.
///
/// The boundary is inclusive: `total_tokens == threshold` triggers a flush.
pub fn should_run_memory_flush(
    entry: Option<&SessionEntry>,
    context_window_tokens: u64,
    reserve_tokens_floor: u64,
    soft_threshold_tokens: u64,
) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    if entry.total_tokens == 0 {
        return false;
    }
    let threshold = context_window_tokens
        .saturating_sub(reserve_tokens_floor)
        .saturating_sub(soft_threshold_tokens);
    if threshold == 0 || entry.total_tokens < threshold {
        return false;
    }
    entry.memory_flush_compaction_count != Some(entry.compaction_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(total_tokens: u64, compaction_count: u64, flushed_at: Option<u64>) -> SessionEntry {
        let mut entry = SessionEntry::new("s", 0);
        entry.total_tokens = total_tokens;
        entry.compaction_count = compaction_count;
        entry.memory_flush_compaction_count = flushed_at;
        entry
    }

    #[test]
    fn unit_flush_threshold_boundary_is_inclusive() {
        // 100_000 - 20_000 - 4_000
        assert!(!should_run_memory_flush(Some(&entry(75_999, 0, None)), 100_000, 20_000, 4_000));
        assert!(should_run_memory_flush(Some(&entry(76_000, 0, None)), 100_000, 20_000, 4_000));
        assert!(should_run_memory_flush(Some(&entry(90_000, 0, None)), 100_000, 20_000, 4_000));
    }

    #[test]
    fn unit_flush_requires_entry_and_tokens() {
        assert!(!should_run_memory_flush(None, 100_000, 20_000, 4_000));
        assert!(!should_run_memory_flush(Some(&entry(0, 0, None)), 100_000, 20_000, 4_000));
    }

    #[test]
    fn regression_flush_runs_once_per_compaction_cycle() {
        assert!(!should_run_memory_flush(Some(&entry(90_000, 2, Some(2))), 100_000, 20_000, 4_000));
        assert!(should_run_memory_flush(Some(&entry(90_000, 3, Some(2))), 100_000, 20_000, 4_000));
    }

    #[test]
    fn regression_tiny_window_never_flushes() {
        assert!(!should_run_memory_flush(Some(&entry(50_000, 0, None)), 20_000, 20_000, 4_000));
    }

    #[test]
    fn unit_flush_prompt_ends_with_sentinel() {
        let settings = MemoryFlushSettings::default();
        assert!(settings.flush_prompt().ends_with(SILENT_REPLY_TOKEN));
        assert!(settings.flush_system_prompt().ends_with(SILENT_REPLY_TOKEN));
        let custom = MemoryFlushSettings {
            prompt: "save notes; reply NO_REPLY  ".to_string(),
            ..MemoryFlushSettings::default()
        };
        assert_eq!(custom.flush_prompt(), "save notes; reply NO_REPLY");
        assert!(is_silent_reply(" NO_REPLY\n"));
        assert!(!is_silent_reply("NO_REPLY but also this"));
    }
}
