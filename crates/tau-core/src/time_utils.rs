use std::sync::Arc;

/// Injectable millisecond clock used by cooldown and debounce bookkeeping.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_ms` is present and falls at or before `now_ms + margin_ms`.
pub fn is_expired_unix_ms(expires_ms: Option<u64>, now_ms: u64, margin_ms: u64) -> bool {
    matches!(expires_ms, Some(value) if value <= now_ms.saturating_add(margin_ms))
}
