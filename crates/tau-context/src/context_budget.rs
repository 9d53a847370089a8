//! Budget configuration and the per-run planning entry points used by the
//! dispatcher.
use serde::{Deserialize, Serialize};
use tau_session::{JournalMessage, JournalRecord, SessionEntry};

use crate::cache_ttl::{
    cache_refresh_due, is_cache_ttl_eligible_provider, read_last_cache_ttl_timestamp,
    DEFAULT_CACHE_REFRESH_MARGIN_MS, DEFAULT_CACHE_TTL_MS,
};
use crate::history_pruning::{
    prune_history_for_context_share, HistoryPruneResult, DEFAULT_MAX_HISTORY_SHARE,
    DEFAULT_PRUNE_PARTS,
};
use crate::memory_flush::{should_run_memory_flush, MemoryFlushSettings};
use crate::reserve_floor::{ensure_reserve_tokens_floor, ReserveFloorResult, DEFAULT_RESERVE_TOKENS_FLOOR};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
/// Public struct `ContextBudgetConfig` used across Tau components.
pub struct ContextBudgetConfig {
    pub context_window_tokens: u64,
    pub reserve_tokens: u64,
    pub reserve_tokens_floor: u64,
    pub max_history_share: f64,
    pub prune_parts: usize,
    pub memory_flush: MemoryFlushSettings,
    pub cache_ttl_ms: u64,
    pub cache_refresh_margin_ms: u64,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 200_000,
            reserve_tokens: 16_384,
            reserve_tokens_floor: DEFAULT_RESERVE_TOKENS_FLOOR,
            max_history_share: DEFAULT_MAX_HISTORY_SHARE,
            prune_parts: DEFAULT_PRUNE_PARTS,
            memory_flush: MemoryFlushSettings::default(),
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            cache_refresh_margin_ms: DEFAULT_CACHE_REFRESH_MARGIN_MS,
        }
    }
}

#[derive(Debug, Clone)]
/// Public struct `ContextBudgetGovernor` used across Tau components.
pub struct ContextBudgetGovernor {
    config: ContextBudgetConfig,
    reserve: ReserveFloorResult,
}

impl ContextBudgetGovernor {
    pub fn new(config: ContextBudgetConfig) -> Self {
        let reserve = ensure_reserve_tokens_floor(config.reserve_tokens, config.reserve_tokens_floor);
        if reserve.did_override {
            tracing::info!(
                configured = config.reserve_tokens,
                floor = config.reserve_tokens_floor,
                "raised reserve tokens to floor"
            );
        }
        Self { config, reserve }
    }

    pub fn config(&self) -> &ContextBudgetConfig {
        &self.config
    }

    pub fn reserve(&self) -> ReserveFloorResult {
        self.reserve
    }

    /// Context tokens left for prompt and history once the reserve is held back.
    pub fn available_context_tokens(&self) -> u64 {
        self.config
            .context_window_tokens
            .saturating_sub(self.reserve.reserve_tokens)
    }

    pub fn should_flush_memory(&self, entry: Option<&SessionEntry>) -> bool {
        self.config.memory_flush.enabled
            && should_run_memory_flush(
                entry,
                self.config.context_window_tokens,
                self.reserve.reserve_tokens,
                self.config.memory_flush.soft_threshold_tokens,
            )
    }

    /// Prunes `history` for the next run. `already_spent_tokens` (e.g. the
    /// memory flush turn) shrinks the budget before pruning.
    pub fn plan_history(
        &self,
        history: &[JournalMessage],
        already_spent_tokens: u64,
    ) -> HistoryPruneResult {
        let max_context_tokens = self
            .available_context_tokens()
            .saturating_sub(already_spent_tokens);
        prune_history_for_context_share(
            history,
            max_context_tokens,
            self.config.max_history_share,
            self.config.prune_parts,
        )
    }

    pub fn cache_keepalive_due(
        &self,
        provider: &str,
        model: &str,
        records: &[JournalRecord],
        now_ms: u64,
    ) -> bool {
        is_cache_ttl_eligible_provider(provider, model)
            && cache_refresh_due(
                read_last_cache_ttl_timestamp(records),
                now_ms,
                self.config.cache_ttl_ms,
                self.config.cache_refresh_margin_ms,
            )
    }
}

/// Summary line recorded in the journal's compaction record.
pub fn compaction_summary(result: &HistoryPruneResult) -> String {
    format!(
        "Pruned {} older message(s) in {} chunk(s), ~{} tokens, to fit a {}-token history budget.",
        result.dropped_messages, result.dropped_chunks, result.dropped_tokens, result.budget_tokens
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_governor_applies_reserve_floor() {
        let governor = ContextBudgetGovernor::new(ContextBudgetConfig {
            context_window_tokens: 100_000,
            reserve_tokens: 1_000,
            ..ContextBudgetConfig::default()
        });
        assert!(governor.reserve().did_override);
        assert_eq!(governor.available_context_tokens(), 80_000);
    }

    #[test]
    fn functional_flush_tokens_shrink_prune_budget() {
        let governor = ContextBudgetGovernor::new(ContextBudgetConfig {
            context_window_tokens: 20_400,
            reserve_tokens: 20_000,
            ..ContextBudgetConfig::default()
        });
        let history: Vec<JournalMessage> = (0..6)
            .map(|index| JournalMessage::user(format!("{index}{}", "y".repeat(120))))
            .collect();
        let relaxed = governor.plan_history(&history, 0);
        let squeezed = governor.plan_history(&history, 300);
        assert_eq!(relaxed.budget_tokens, 200);
        assert_eq!(squeezed.budget_tokens, 50);
        assert!(squeezed.messages.len() < relaxed.messages.len());
    }

    #[test]
    fn unit_flush_disabled_by_config() {
        let mut config = ContextBudgetConfig::default();
        config.memory_flush.enabled = false;
        let governor = ContextBudgetGovernor::new(config);
        let mut entry = SessionEntry::new("s", 0);
        entry.total_tokens = 199_000;
        assert!(!governor.should_flush_memory(Some(&entry)));
    }

    #[test]
    fn unit_compaction_summary_mentions_counts() {
        let summary = compaction_summary(&HistoryPruneResult {
            dropped_messages: 3,
            dropped_chunks: 1,
            dropped_tokens: 120,
            budget_tokens: 500,
            ..HistoryPruneResult::default()
        });
        assert!(summary.contains("3 older message"));
        assert!(summary.contains("500-token"));
    }
}
