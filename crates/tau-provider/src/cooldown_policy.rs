//! Reason-specific cooldown and disable windows for failing auth profiles.
use serde::{Deserialize, Serialize};

use crate::auth_profile_store::ProfileUsageStats;
use crate::types::AuthFailureReason;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
/// Public struct `CooldownPolicy` used across Tau components.
pub struct CooldownPolicy {
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub billing_base_ms: u64,
    pub billing_max_ms: u64,
    pub auth_disable_ms: u64,
    pub failure_window_ms: u64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base_cooldown_ms: MINUTE_MS,
            max_cooldown_ms: HOUR_MS,
            billing_base_ms: 5 * HOUR_MS,
            billing_max_ms: 24 * HOUR_MS,
            auth_disable_ms: 24 * HOUR_MS,
            failure_window_ms: 24 * HOUR_MS,
        }
    }
}

impl CooldownPolicy {
    /// `min(max, base * 5^min(n-1, 3))`
    pub fn cooldown_ms(&self, error_count: u32) -> u64 {
        let exponent = error_count.saturating_sub(1).min(3);
        self.base_cooldown_ms
            .saturating_mul(5u64.pow(exponent))
            .min(self.max_cooldown_ms)
    }

    /// `min(max, base * 2^min(n-1, 10))`
    pub fn billing_disable_ms(&self, error_count: u32) -> u64 {
        let exponent = error_count.saturating_sub(1).min(10);
        self.billing_base_ms
            .saturating_mul(2u64.pow(exponent))
            .min(self.billing_max_ms)
    }

    /// Records one failed attempt on `stats`.
    pub fn apply_failure(&self, stats: &mut ProfileUsageStats, reason: AuthFailureReason, now_ms: u64) {
        let window_expired = stats
            .last_failure_at
            .is_some_and(|last| now_ms.saturating_sub(last) > self.failure_window_ms);
        if window_expired {
            stats.error_count = 0;
            stats.failure_counts.clear();
        }

        stats.error_count = stats.error_count.saturating_add(1);
        *stats
            .failure_counts
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        stats.last_failure_at = Some(now_ms);
        stats.last_used = Some(now_ms);

        match reason {
            AuthFailureReason::Billing => {
                stats.disabled_until =
                    Some(now_ms.saturating_add(self.billing_disable_ms(stats.error_count)));
                stats.disabled_reason = Some(reason);
            }
            AuthFailureReason::Auth => {
                stats.disabled_until = Some(now_ms.saturating_add(self.auth_disable_ms));
                stats.disabled_reason = Some(reason);
            }
            AuthFailureReason::RateLimit
            | AuthFailureReason::Timeout
            | AuthFailureReason::Format
            | AuthFailureReason::Unknown => {
                stats.cooldown_until =
                    Some(now_ms.saturating_add(self.cooldown_ms(stats.error_count)));
                stats.cooldown_reason = Some(reason);
            }
        }
    }

    pub fn apply_success(&self, stats: &mut ProfileUsageStats, now_ms: u64) {
        *stats = ProfileUsageStats {
            last_used: Some(now_ms),
            ..ProfileUsageStats::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cooldown_grows_by_five_and_caps_at_one_hour() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.cooldown_ms(1), MINUTE_MS);
        assert_eq!(policy.cooldown_ms(2), 5 * MINUTE_MS);
        assert_eq!(policy.cooldown_ms(3), 25 * MINUTE_MS);
        assert_eq!(policy.cooldown_ms(4), HOUR_MS);
        assert_eq!(policy.cooldown_ms(40), HOUR_MS);
    }

    #[test]
    fn unit_billing_disable_doubles_and_caps_at_one_day() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.billing_disable_ms(1), 5 * HOUR_MS);
        assert_eq!(policy.billing_disable_ms(2), 10 * HOUR_MS);
        assert_eq!(policy.billing_disable_ms(3), 20 * HOUR_MS);
        assert_eq!(policy.billing_disable_ms(4), 24 * HOUR_MS);
    }

    #[test]
    fn functional_rate_limit_sets_cooldown_and_counts() {
        let policy = CooldownPolicy::default();
        let mut stats = ProfileUsageStats::default();
        policy.apply_failure(&mut stats, AuthFailureReason::RateLimit, 1_000);
        policy.apply_failure(&mut stats, AuthFailureReason::RateLimit, 2_000);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.failure_counts.get("rate_limit"), Some(&2));
        assert_eq!(stats.cooldown_until, Some(2_000 + 5 * MINUTE_MS));
        assert_eq!(stats.disabled_until, None);
        assert_eq!(
            stats.unavailable_until(2_001),
            Some((2_000 + 5 * MINUTE_MS, AuthFailureReason::RateLimit))
        );
        assert_eq!(stats.unavailable_until(2_000 + 5 * MINUTE_MS), None);
    }

    #[test]
    fn functional_auth_failure_disables_for_a_day() {
        let policy = CooldownPolicy::default();
        let mut stats = ProfileUsageStats::default();
        policy.apply_failure(&mut stats, AuthFailureReason::Auth, 10);
        assert_eq!(stats.disabled_until, Some(10 + 24 * HOUR_MS));
        assert_eq!(stats.disabled_reason, Some(AuthFailureReason::Auth));
    }

    #[test]
    fn regression_counters_reset_after_failure_window() {
        let policy = CooldownPolicy::default();
        let mut stats = ProfileUsageStats::default();
        policy.apply_failure(&mut stats, AuthFailureReason::Timeout, 0);
        policy.apply_failure(&mut stats, AuthFailureReason::Timeout, 1);
        let later = 1 + 24 * HOUR_MS + 1;
        policy.apply_failure(&mut stats, AuthFailureReason::Timeout, later);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.cooldown_until, Some(later + MINUTE_MS));
    }

    #[test]
    fn unit_success_clears_failure_state() {
        let policy = CooldownPolicy::default();
        let mut stats = ProfileUsageStats::default();
        policy.apply_failure(&mut stats, AuthFailureReason::Billing, 5);
        policy.apply_success(&mut stats, 9);
        assert_eq!(stats, ProfileUsageStats {
            last_used: Some(9),
            ..ProfileUsageStats::default()
        });
    }
}
