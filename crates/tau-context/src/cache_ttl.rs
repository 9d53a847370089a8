//! Prompt-cache TTL tracking for providers that expire cached prefixes.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tau_session::JournalRecord;

pub const CACHE_TTL_CUSTOM_TYPE: &str = "cache-ttl";
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_CACHE_REFRESH_MARGIN_MS: u64 = 30 * 1_000;

const CACHE_TTL_NATIVE_PROVIDERS: &[&str] = &["anthropic", "moonshot", "zai"];
/// Routing providers eligible only for models under these namespaces.
const CACHE_TTL_ROUTED_MODEL_PREFIXES: &[(&str, &str)] = &[("openrouter", "anthropic/")];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Payload of the `cache-ttl` journal marker.
pub struct CacheTtlMarker {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CacheTtlMarker {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn is_cache_ttl_eligible_provider(provider: &str, model: &str) -> bool {
    let provider = provider.trim().to_ascii_lowercase();
    if CACHE_TTL_NATIVE_PROVIDERS.contains(&provider.as_str()) {
        return true;
    }
    let model = model.trim().to_ascii_lowercase();
    CACHE_TTL_ROUTED_MODEL_PREFIXES
        .iter()
        .any(|(routed, prefix)| provider == *routed && model.starts_with(prefix))
}

/// Timestamp of the newest `cache-ttl` marker; scans from the end.
pub fn read_last_cache_ttl_timestamp(records: &[JournalRecord]) -> Option<u64> {
    records.iter().rev().find_map(|record| match record {
        JournalRecord::Custom(custom) if custom.custom_type == CACHE_TTL_CUSTOM_TYPE => custom
            .data
            .get("timestamp")
            .and_then(Value::as_u64)
            .or(Some(custom.timestamp)),
        _ => None,
    })
}

/// True inside the refresh window `[last + ttl - margin, last + ttl)`.
/// Once the TTL has elapsed the cache is gone and a keepalive is pointless.
pub fn cache_refresh_due(last_marker_ms: Option<u64>, now_ms: u64, ttl_ms: u64, margin_ms: u64) -> bool {
    let Some(last) = last_marker_ms else {
        return false;
    };
    let elapsed = now_ms.saturating_sub(last);
    elapsed >= ttl_ms.saturating_sub(margin_ms) && elapsed < ttl_ms
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tau_session::{CustomRecord, JournalMessage, MessageRecord};

    use super::*;

    fn marker(id: u64, timestamp: u64) -> JournalRecord {
        JournalRecord::Custom(CustomRecord {
            id,
            custom_type: CACHE_TTL_CUSTOM_TYPE.to_string(),
            data: json!({"timestamp": timestamp, "provider": "anthropic"}),
            timestamp: id,
        })
    }

    #[test]
    fn unit_eligibility_matches_native_and_routed_providers() {
        assert!(is_cache_ttl_eligible_provider("Anthropic", "claude-sonnet"));
        assert!(is_cache_ttl_eligible_provider("openrouter", "anthropic/claude-3.5"));
        assert!(!is_cache_ttl_eligible_provider("openrouter", "openai/gpt-4o"));
        assert!(!is_cache_ttl_eligible_provider("openai", "gpt-4o"));
    }

    #[test]
    fn unit_last_marker_scan_prefers_newest() {
        let records = vec![
            marker(1, 100),
            JournalRecord::Message(MessageRecord {
                id: 2,
                parent_id: None,
                timestamp: 2,
                message: JournalMessage::user("hi"),
            }),
            marker(3, 300),
            JournalRecord::Custom(CustomRecord {
                id: 4,
                custom_type: "other".to_string(),
                data: json!({"timestamp": 999}),
                timestamp: 4,
            }),
        ];
        assert_eq!(read_last_cache_ttl_timestamp(&records), Some(300));
        assert_eq!(read_last_cache_ttl_timestamp(&records[..1]), Some(100));
        assert_eq!(read_last_cache_ttl_timestamp(&[]), None);
    }

    #[test]
    fn unit_refresh_due_only_inside_window() {
        let ttl = DEFAULT_CACHE_TTL_MS;
        let margin = DEFAULT_CACHE_REFRESH_MARGIN_MS;
        assert!(!cache_refresh_due(None, 10, ttl, margin));
        assert!(!cache_refresh_due(Some(0), ttl - margin - 1, ttl, margin));
        assert!(cache_refresh_due(Some(0), ttl - margin, ttl, margin));
        assert!(cache_refresh_due(Some(0), ttl - 1, ttl, margin));
        assert!(!cache_refresh_due(Some(0), ttl, ttl, margin));
    }
}
