//! On-disk auth profile store: credentials, rotation order, and usage stats.
//!
//! One JSON file per agent scope. Every mutation is a read-modify-write under
//! an advisory lock file followed by an atomic rename, so concurrent sessions
//! (and processes) never interleave partial writes.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tau_core::{is_expired_unix_ms, write_text_atomic};

use crate::types::AuthFailureReason;

pub const AUTH_PROFILE_STORE_VERSION: u32 = 1;
/// Oauth credentials this close to expiry are refreshed before use.
pub const OAUTH_EXPIRY_SAFETY_MARGIN_MS: u64 = 60_000;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Stored credential material for one profile.
pub enum AuthCredential {
    ApiKey {
        provider: String,
        key: String,
    },
    Token {
        provider: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<u64>,
    },
    Oauth {
        provider: String,
        access: String,
        refresh: String,
        expires: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("kind", &self.kind())
            .field("provider", &self.provider())
            .field("expires", &self.expires())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Credential kinds in rotation preference order.
pub enum CredentialKind {
    Oauth,
    Token,
    ApiKey,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::Oauth => "oauth",
            CredentialKind::Token => "token",
            CredentialKind::ApiKey => "api_key",
        }
    }
}

impl AuthCredential {
    pub fn provider(&self) -> &str {
        match self {
            AuthCredential::ApiKey { provider, .. }
            | AuthCredential::Token { provider, .. }
            | AuthCredential::Oauth { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            AuthCredential::ApiKey { .. } => CredentialKind::ApiKey,
            AuthCredential::Token { .. } => CredentialKind::Token,
            AuthCredential::Oauth { .. } => CredentialKind::Oauth,
        }
    }

    pub fn expires(&self) -> Option<u64> {
        match self {
            AuthCredential::ApiKey { .. } => None,
            AuthCredential::Token { expires, .. } => *expires,
            AuthCredential::Oauth { expires, .. } => Some(*expires),
        }
    }

    /// The bearer secret handed to the agent engine.
    pub fn secret(&self) -> &str {
        match self {
            AuthCredential::ApiKey { key, .. } => key,
            AuthCredential::Token { token, .. } => token,
            AuthCredential::Oauth { access, .. } => access,
        }
    }

    /// True when the credential can be used at `now_ms` without a refresh.
    pub fn is_usable_at(&self, now_ms: u64) -> bool {
        match self {
            AuthCredential::ApiKey { key, .. } => !key.trim().is_empty(),
            AuthCredential::Token { token, expires, .. } => {
                !token.trim().is_empty() && !is_expired_unix_ms(*expires, now_ms, 0)
            }
            AuthCredential::Oauth {
                access, expires, ..
            } => {
                !access.trim().is_empty()
                    && !is_expired_unix_ms(Some(*expires), now_ms, OAUTH_EXPIRY_SAFETY_MARGIN_MS)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Rotation bookkeeping for one profile.
pub struct ProfileUsageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_reason: Option<AuthFailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<AuthFailureReason>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<u64>,
}

impl ProfileUsageStats {
    /// Returns `(until, reason)` for the latest block still in force at `now_ms`.
    pub fn unavailable_until(&self, now_ms: u64) -> Option<(u64, AuthFailureReason)> {
        let cooldown = self
            .cooldown_until
            .filter(|until| *until > now_ms)
            .map(|until| (until, self.cooldown_reason.unwrap_or(AuthFailureReason::Unknown)));
        let disabled = self
            .disabled_until
            .filter(|until| *until > now_ms)
            .map(|until| (until, self.disabled_reason.unwrap_or(AuthFailureReason::Unknown)));
        match (cooldown, disabled) {
            (Some(left), Some(right)) => Some(if right.0 >= left.0 { right } else { left }),
            (left, right) => left.or(right),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `AuthProfileStore` used across Tau components.
pub struct AuthProfileStore {
    pub version: u32,
    #[serde(default)]
    pub profiles: BTreeMap<String, AuthCredential>,
    #[serde(default)]
    pub order: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub usage_stats: BTreeMap<String, ProfileUsageStats>,
}

impl Default for AuthProfileStore {
    fn default() -> Self {
        Self {
            version: AUTH_PROFILE_STORE_VERSION,
            profiles: BTreeMap::new(),
            order: BTreeMap::new(),
            usage_stats: BTreeMap::new(),
        }
    }
}

impl AuthProfileStore {
    pub fn stats_mut(&mut self, profile_id: &str) -> &mut ProfileUsageStats {
        self.usage_stats.entry(profile_id.to_string()).or_default()
    }

    /// Profile ids for `provider`: explicit `order[provider]` first, then the
    /// rest by credential kind, least recently used, and id.
    pub fn ordered_profile_ids(&self, provider: &str) -> Vec<String> {
        let provider = normalize_provider_id(provider);
        let matches_provider = |id: &str| {
            self.profiles
                .get(id)
                .is_some_and(|credential| normalize_provider_id(credential.provider()) == provider)
        };

        let mut ordered: Vec<String> = Vec::new();
        if let Some(explicit) = self.order.get(&provider) {
            for id in explicit {
                if matches_provider(id) && !ordered.contains(id) {
                    ordered.push(id.clone());
                }
            }
        }

        let mut remaining: Vec<(&String, &AuthCredential)> = self
            .profiles
            .iter()
            .filter(|(id, _)| matches_provider(id) && !ordered.contains(id))
            .collect();
        remaining.sort_by(|(left_id, left), (right_id, right)| {
            let left_used = self.usage_stats.get(*left_id).and_then(|stats| stats.last_used);
            let right_used = self.usage_stats.get(*right_id).and_then(|stats| stats.last_used);
            left.kind()
                .cmp(&right.kind())
                .then(left_used.unwrap_or(0).cmp(&right_used.unwrap_or(0)))
                .then(left_id.cmp(right_id))
        });
        ordered.extend(remaining.into_iter().map(|(id, _)| id.clone()));
        ordered
    }
}

pub fn normalize_provider_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Reads the store; a missing file is an empty store.
pub fn load_auth_profile_store(path: &Path) -> Result<AuthProfileStore> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AuthProfileStore::default());
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read auth profile store {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(AuthProfileStore::default());
    }
    let store: AuthProfileStore = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse auth profile store {}", path.display()))?;
    if store.version > AUTH_PROFILE_STORE_VERSION {
        bail!(
            "unsupported auth profile store version {} in {} (supported up to {})",
            store.version,
            path.display(),
            AUTH_PROFILE_STORE_VERSION
        );
    }
    Ok(store)
}

pub fn save_auth_profile_store(path: &Path, store: &AuthProfileStore) -> Result<()> {
    let mut encoded =
        serde_json::to_string_pretty(store).context("failed to encode auth profile store")?;
    encoded.push('\n');
    write_text_atomic(path, &encoded)
        .with_context(|| format!("failed to write auth profile store {}", path.display()))
}

pub(crate) fn store_lock_path(path: &Path) -> PathBuf {
    path.with_extension("json.lock")
}
