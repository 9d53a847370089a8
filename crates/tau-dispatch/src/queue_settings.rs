use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_QUEUE_CAP: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// How an inbound message interacts with an in-flight run.
pub enum QueueMode {
    Steer,
    Followup,
    Collect,
    SteerBacklog,
    Queue,
    Interrupt,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueMode::Steer => "steer",
            QueueMode::Followup => "followup",
            QueueMode::Collect => "collect",
            QueueMode::SteerBacklog => "steer-backlog",
            QueueMode::Queue => "queue",
            QueueMode::Interrupt => "interrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `DedupeMode` values.
pub enum DedupeMode {
    MessageId,
    Prompt,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `DropPolicy` values.
pub enum DropPolicy {
    Old,
    New,
    Summarize,
}

impl DropPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DropPolicy::Old => "old",
            DropPolicy::New => "new",
            DropPolicy::Summarize => "summarize",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
/// Public struct `QueueSettings` used across Tau components.
pub struct QueueSettings {
    pub mode: QueueMode,
    pub dedupe_mode: DedupeMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop_policy: DropPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Collect,
            dedupe_mode: DedupeMode::MessageId,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            cap: DEFAULT_QUEUE_CAP,
            drop_policy: DropPolicy::Summarize,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
/// Field-by-field override of `QueueSettings`.
pub struct QueueSettingsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<QueueMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_mode: Option<DedupeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_policy: Option<DropPolicy>,
}

impl QueueSettings {
    pub fn with_override(self, overrides: &QueueSettingsOverride) -> Self {
        Self {
            mode: overrides.mode.unwrap_or(self.mode),
            dedupe_mode: overrides.dedupe_mode.unwrap_or(self.dedupe_mode),
            debounce_ms: overrides.debounce_ms.unwrap_or(self.debounce_ms),
            cap: overrides.cap.unwrap_or(self.cap).max(1),
            drop_policy: overrides.drop_policy.unwrap_or(self.drop_policy),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
/// Default queue settings plus per-channel overrides.
pub struct QueueConfig {
    pub defaults: QueueSettings,
    pub channels: BTreeMap<String, QueueSettingsOverride>,
}

impl QueueConfig {
    pub fn settings_for_channel(&self, channel: &str) -> QueueSettings {
        let channel = channel.trim().to_ascii_lowercase();
        match self.channels.get(&channel) {
            Some(overrides) => self.defaults.with_override(overrides),
            None => self.defaults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_defaults_match_documented_values() {
        let settings = QueueSettings::default();
        assert_eq!(settings.mode, QueueMode::Collect);
        assert_eq!(settings.dedupe_mode, DedupeMode::MessageId);
        assert_eq!(settings.debounce_ms, 1_000);
        assert_eq!(settings.cap, 20);
        assert_eq!(settings.drop_policy, DropPolicy::Summarize);
    }

    #[test]
    fn functional_channel_override_inherits_unset_fields() {
        let config: QueueConfig = serde_json::from_value(serde_json::json!({
            "defaults": {"mode": "followup", "cap": 5},
            "channels": {"telegram": {"mode": "steer-backlog", "debounceMs": 0}}
        }))
        .expect("config");
        let telegram = config.settings_for_channel("Telegram");
        assert_eq!(telegram.mode, QueueMode::SteerBacklog);
        assert_eq!(telegram.debounce_ms, 0);
        assert_eq!(telegram.cap, 5);
        assert_eq!(config.settings_for_channel("slack").mode, QueueMode::Followup);
    }

    #[test]
    fn regression_unknown_queue_fields_are_rejected() {
        let parsed = serde_json::from_value::<QueueSettings>(serde_json::json!({"modee": "steer"}));
        assert!(parsed.is_err());
    }
}
