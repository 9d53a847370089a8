//! Echo suppression: messages we delivered, keyed by session, for 24 hours.
//!
//! Delivered messages are remembered by platform message id. Reply text is
//! remembered too, but only matched for inbound messages from one of the
//! gateway's own sender ids, so a user repeating a reply is never dropped.
//! Expired entries are swept on insert once the cache grows past a
//! threshold; there is no background timer.
use std::collections::HashMap;

pub const DEFAULT_SENT_MESSAGE_TTL_MS: u64 = 24 * 60 * 60 * 1_000;
pub const DEFAULT_SENT_MESSAGE_SWEEP_THRESHOLD: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SentKey {
    MessageId(String),
    Text(String),
}

#[derive(Debug, Clone)]
/// Public struct `SentMessageCache` used across Tau components.
pub struct SentMessageCache {
    ttl_ms: u64,
    sweep_threshold: usize,
    entries: HashMap<(String, SentKey), u64>,
}

impl Default for SentMessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_SENT_MESSAGE_TTL_MS, DEFAULT_SENT_MESSAGE_SWEEP_THRESHOLD)
    }
}

impl SentMessageCache {
    pub fn new(ttl_ms: u64, sweep_threshold: usize) -> Self {
        Self {
            ttl_ms,
            sweep_threshold: sweep_threshold.max(1),
            entries: HashMap::new(),
        }
    }

    /// Remembers one delivered reply and the platform ids it was sent under.
    pub fn record(&mut self, session_key: &str, message_ids: &[String], text: &str, now_ms: u64) {
        for message_id in message_ids {
            let message_id = message_id.trim();
            if !message_id.is_empty() {
                self.entries.insert(
                    (session_key.to_string(), SentKey::MessageId(message_id.to_string())),
                    now_ms,
                );
            }
        }
        let normalized = normalize_text(text);
        if !normalized.is_empty() {
            self.entries
                .insert((session_key.to_string(), SentKey::Text(normalized)), now_ms);
        }
        if self.entries.len() > self.sweep_threshold {
            self.sweep(now_ms);
        }
    }

    /// True when `message_id` is one of our own deliveries to `session_key`.
    pub fn was_sent_with_id(&self, session_key: &str, message_id: &str, now_ms: u64) -> bool {
        let message_id = message_id.trim();
        if message_id.is_empty() {
            return false;
        }
        self.is_live(
            &(session_key.to_string(), SentKey::MessageId(message_id.to_string())),
            now_ms,
        )
    }

    /// True when `text` matches a reply sent to `session_key` within the TTL.
    pub fn was_recently_sent(&self, session_key: &str, text: &str, now_ms: u64) -> bool {
        self.is_live(
            &(session_key.to_string(), SentKey::Text(normalize_text(text))),
            now_ms,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, key: &(String, SentKey), now_ms: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|sent_at| now_ms.saturating_sub(*sent_at) < self.ttl_ms)
    }

    fn sweep(&mut self, now_ms: u64) {
        let ttl_ms = self.ttl_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, sent_at| now_ms.saturating_sub(*sent_at) < ttl_ms);
        let swept = before - self.entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = self.entries.len(), "swept sent-message cache");
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_recent_reply_is_recognized_per_session() {
        let mut cache = SentMessageCache::default();
        cache.record("s1", &[], "Hello   there\n", 1_000);
        assert!(cache.was_recently_sent("s1", "Hello there", 2_000));
        assert!(!cache.was_recently_sent("s2", "Hello there", 2_000));
        assert!(!cache.was_recently_sent("s1", "Hello", 2_000));
    }

    #[test]
    fn unit_delivered_ids_are_recognized_per_session() {
        let mut cache = SentMessageCache::default();
        cache.record("s1", &["out-1".to_string(), " ".to_string()], "hi", 1_000);
        assert!(cache.was_sent_with_id("s1", "out-1", 2_000));
        assert!(!cache.was_sent_with_id("s2", "out-1", 2_000));
        assert!(!cache.was_sent_with_id("s1", "", 2_000));
        assert!(!cache.was_sent_with_id("s1", "hi", 2_000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn unit_replies_expire_after_ttl() {
        let mut cache = SentMessageCache::new(100, 10);
        cache.record("s1", &["out-1".to_string()], "hi", 0);
        assert!(cache.was_recently_sent("s1", "hi", 99));
        assert!(cache.was_sent_with_id("s1", "out-1", 99));
        assert!(!cache.was_recently_sent("s1", "hi", 100));
        assert!(!cache.was_sent_with_id("s1", "out-1", 100));
    }

    #[test]
    fn regression_sweep_runs_only_past_threshold() {
        let mut cache = SentMessageCache::new(100, 2);
        cache.record("s", &[], "a", 0);
        cache.record("s", &[], "b", 0);
        assert_eq!(cache.len(), 2);
        cache.record("s", &[], "c", 500);
        assert_eq!(cache.len(), 1);
        assert!(cache.was_recently_sent("s", "c", 550));
    }
}
