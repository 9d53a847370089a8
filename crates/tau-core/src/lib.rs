//! Foundational low-level utilities shared across Tau gateway crates.
//!
//! Provides atomic (permission preserving) file writes, advisory lock files for
//! read-modify-write cycles on shared state, and millisecond clock helpers used
//! by cooldown, expiry, and journal timestamp calculations.

pub mod atomic_io;
pub mod file_lock;
pub mod time_utils;

pub use atomic_io::{write_text_atomic, write_text_atomic_preserving_permissions};
pub use file_lock::{acquire_file_lock, try_acquire_file_lock, FileLockGuard};
pub use time_utils::{current_unix_timestamp_ms, is_expired_unix_ms, ClockFn};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_millisecond_clock_is_past_2023() {
        assert!(current_unix_timestamp_ms() > 1_672_531_200_000);
    }

    #[test]
    fn unit_is_expired_unix_ms_applies_safety_margin() {
        let now = 1_700_000_000_000;
        assert!(!is_expired_unix_ms(None, now, 0));
        assert!(is_expired_unix_ms(Some(now), now, 0));
        assert!(!is_expired_unix_ms(Some(now + 1), now, 0));
        assert!(is_expired_unix_ms(Some(now + 30_000), now, 60_000));
        assert!(!is_expired_unix_ms(Some(now + 90_000), now, 60_000));
    }

    #[test]
    fn functional_write_text_atomic_replaces_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("sample.json");
        write_text_atomic(&path, "first").expect("write first");
        write_text_atomic(&path, "second").expect("write second");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "second");
    }
}
