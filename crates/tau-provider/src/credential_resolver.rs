//! Credential rotation: profile selection, oauth refresh under lock, and
//! parent-scope fallback.
//!
//! A resolver owns one agent-scope store file and optionally the parent
//! (main agent) store. Refreshes re-read the store while holding its lock so a
//! token already refreshed by another session is reused instead of spent twice.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{bail, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tau_core::{current_unix_timestamp_ms, try_acquire_file_lock, ClockFn, FileLockGuard};

use crate::auth_profile_store::{
    load_auth_profile_store, normalize_provider_id, save_auth_profile_store, store_lock_path,
    AuthCredential, AuthProfileStore, CredentialKind,
};
use crate::cooldown_policy::CooldownPolicy;
use crate::oauth_refresh::OAuthRefresher;
use crate::types::{AuthFailureReason, CredentialError};

const DEFAULT_LOCK_WAIT_MS: u64 = 10_000;
const DEFAULT_LOCK_STALE_MS: u64 = 60_000;
const LOCK_POLL_MS: u64 = 25;
const DEFAULT_OAUTH_EXPIRES_IN_SECS: u64 = 3_600;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Where a resolved credential came from.
pub enum CredentialSource {
    Store,
    Refreshed,
    Parent,
}

#[derive(Clone, PartialEq, Eq)]
/// Credential handed to one agent run.
pub struct ResolvedCredential {
    pub profile_id: String,
    pub provider: String,
    pub kind: CredentialKind,
    pub secret: String,
    pub expires: Option<u64>,
    pub source: CredentialSource,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("profile_id", &self.profile_id)
            .field("provider", &self.provider)
            .field("kind", &self.kind)
            .field("secret", &"[REDACTED]")
            .field("expires", &self.expires)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A profile pinned on the session entry.
pub struct ProfilePin {
    pub profile_id: String,
    /// User pins are never substituted by rotation.
    pub user: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Redacted per-profile status row for operators.
pub struct AuthProfileStatus {
    pub profile_id: String,
    pub provider: String,
    pub kind: &'static str,
    pub state: &'static str,
    pub secret_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<AuthFailureReason>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
}

#[derive(Clone)]
/// Public struct `AuthProfileResolver` used across Tau components.
pub struct AuthProfileResolver {
    store_path: PathBuf,
    parent_store_path: Option<PathBuf>,
    refresher: Option<Arc<dyn OAuthRefresher>>,
    cooldown: CooldownPolicy,
    clock: ClockFn,
    lock_wait: Duration,
    lock_stale: Duration,
}

impl AuthProfileResolver {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            parent_store_path: None,
            refresher: None,
            cooldown: CooldownPolicy::default(),
            clock: Arc::new(current_unix_timestamp_ms),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            lock_stale: Duration::from_millis(DEFAULT_LOCK_STALE_MS),
        }
    }

    pub fn with_parent_store(mut self, parent_store_path: impl Into<PathBuf>) -> Self {
        self.parent_store_path = Some(parent_store_path.into());
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn OAuthRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_cooldown_policy(mut self, cooldown: CooldownPolicy) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn load_store(&self) -> Result<AuthProfileStore> {
        load_auth_profile_store(&self.store_path)
    }

    /// Picks a usable credential for `provider`, honouring the session pin.
    ///
    /// A user pin is resolved on its own and never replaced. An auto pin is
    /// tried first and then rotation continues through the ordered profiles.
    pub async fn resolve_for_provider(
        &self,
        provider: &str,
        pin: Option<&ProfilePin>,
    ) -> Result<ResolvedCredential, CredentialError> {
        if let Some(pin) = pin.filter(|pin| pin.user) {
            let resolved = self.resolve_profile(&pin.profile_id).await;
            if let Err(error) = &resolved {
                tracing::warn!(
                    profile_id = %pin.profile_id,
                    reason = error.reason().as_str(),
                    "pinned auth profile unusable: {error}"
                );
                if !matches!(error, CredentialError::Store(_)) {
                    if let Err(mark_error) = self.mark_failure(&pin.profile_id, error.reason()).await {
                        tracing::warn!(
                            profile_id = %pin.profile_id,
                            "failed to record auth profile failure: {mark_error:#}"
                        );
                    }
                }
            }
            return resolved;
        }

        let provider = normalize_provider_id(provider);
        let now = (self.clock)();
        let store = self.load_store()?;
        let mut candidates: Vec<String> = Vec::new();
        let mut soonest_block: Option<(u64, AuthFailureReason)> = None;
        // An auto pin is only a preference: it goes first but is still
        // subject to cooldown like every other profile.
        let pinned = pin
            .map(|pin| pin.profile_id.clone())
            .filter(|profile_id| store.profiles.contains_key(profile_id));
        for profile_id in pinned.into_iter().chain(store.ordered_profile_ids(&provider)) {
            if candidates.contains(&profile_id) {
                continue;
            }
            let block = store
                .usage_stats
                .get(&profile_id)
                .and_then(|stats| stats.unavailable_until(now));
            match block {
                Some(block) => {
                    tracing::debug!(
                        profile_id = %profile_id,
                        until = block.0,
                        reason = block.1.as_str(),
                        "skipping auth profile in cooldown"
                    );
                    if soonest_block.map_or(true, |current| block.0 < current.0) {
                        soonest_block = Some(block);
                    }
                }
                None => candidates.push(profile_id),
            }
        }

        let mut last_error = None;
        for profile_id in candidates {
            match self.resolve_profile(&profile_id).await {
                Ok(resolved) => return Ok(resolved),
                Err(error) => {
                    tracing::warn!(
                        profile_id = %profile_id,
                        reason = error.reason().as_str(),
                        "auth profile unusable, rotating: {error}"
                    );
                    if !matches!(error, CredentialError::Store(_)) {
                        self.mark_failure(&profile_id, error.reason()).await?;
                    }
                    last_error = Some(error);
                }
            }
        }

        if let Some(error) = last_error {
            return Err(error);
        }
        Err(CredentialError::NoAvailableProfile {
            provider,
            reason: soonest_block.map(|(_, reason)| reason),
            retry_at_ms: soonest_block.map(|(until, _)| until),
        })
    }

    /// Resolves one profile id, refreshing oauth credentials that are expired
    /// or inside the safety margin. A successful resolve stamps `lastUsed`
    /// whatever the run's outcome turns out to be.
    pub async fn resolve_profile(&self, profile_id: &str) -> Result<ResolvedCredential, CredentialError> {
        let resolved = self.resolve_profile_credential(profile_id).await?;
        let now = (self.clock)();
        self.mutate_store(|store| {
            store.stats_mut(profile_id).last_used = Some(now);
            Ok(())
        })
        .await?;
        Ok(resolved)
    }

    async fn resolve_profile_credential(
        &self,
        profile_id: &str,
    ) -> Result<ResolvedCredential, CredentialError> {
        let now = (self.clock)();
        let store = self.load_store()?;
        let Some(credential) = store.profiles.get(profile_id).cloned() else {
            return match self.inherit_from_parent(profile_id).await? {
                Some(inherited) => Ok(inherited),
                None => Err(CredentialError::ProfileMissing {
                    profile_id: profile_id.to_string(),
                }),
            };
        };

        if credential.is_usable_at(now) {
            return Ok(resolved(profile_id, &credential, CredentialSource::Store));
        }
        match credential {
            AuthCredential::Oauth { .. } => self.refresh_oauth_profile(profile_id).await,
            AuthCredential::Token { provider, .. } => {
                if let Some(inherited) = self.inherit_from_parent(profile_id).await? {
                    return Ok(inherited);
                }
                Err(CredentialError::StaticTokenExpired {
                    profile_id: profile_id.to_string(),
                    provider,
                })
            }
            AuthCredential::ApiKey { .. } => Err(CredentialError::ProfileMissing {
                profile_id: profile_id.to_string(),
            }),
        }
    }

    async fn refresh_oauth_profile(&self, profile_id: &str) -> Result<ResolvedCredential, CredentialError> {
        let refresh_outcome = {
            let _guard = self.lock_store_file(&self.store_path).await?;
            let mut store = self.load_store()?;
            let Some(AuthCredential::Oauth {
                provider,
                refresh,
                email,
                ..
            }) = store.profiles.get(profile_id).cloned()
            else {
                return Err(CredentialError::ProfileMissing {
                    profile_id: profile_id.to_string(),
                });
            };

            // Another session may have refreshed while we waited for the lock.
            let now = (self.clock)();
            if let Some(current) = store.profiles.get(profile_id) {
                if current.is_usable_at(now) {
                    tracing::debug!(profile_id, "reusing credential refreshed by another session");
                    return Ok(resolved(profile_id, current, CredentialSource::Store));
                }
            }

            let outcome = match &self.refresher {
                Some(refresher) => refresher
                    .refresh(&provider, &refresh)
                    .await
                    .map_err(|error| error.to_string()),
                None => Err("no OAuth refresher configured".to_string()),
            };
            match outcome {
                Ok(tokens) => {
                    let now = (self.clock)();
                    let expires_in_ms = tokens
                        .expires_in_secs
                        .unwrap_or(DEFAULT_OAUTH_EXPIRES_IN_SECS)
                        .saturating_mul(1_000);
                    let refreshed = AuthCredential::Oauth {
                        provider: provider.clone(),
                        access: tokens.access_token,
                        refresh: tokens.refresh_token.unwrap_or(refresh),
                        expires: now.saturating_add(expires_in_ms),
                        email,
                    };
                    store
                        .profiles
                        .insert(profile_id.to_string(), refreshed.clone());
                    save_auth_profile_store(&self.store_path, &store)?;
                    tracing::info!(profile_id, provider = %provider, "refreshed oauth credential");
                    return Ok(resolved(profile_id, &refreshed, CredentialSource::Refreshed));
                }
                Err(message) => (provider, message),
            }
        };

        let (provider, message) = refresh_outcome;
        tracing::warn!(profile_id, provider = %provider, "oauth refresh failed: {message}");
        if let Some(inherited) = self.inherit_from_parent(profile_id).await? {
            return Ok(inherited);
        }
        Err(CredentialError::TokenRefreshFailed {
            provider,
            profile_id: profile_id.to_string(),
            message,
        })
    }

    /// Copies the parent scope's usable credential for `profile_id` into this
    /// scope's store. Returns `None` without a parent or a usable credential.
    async fn inherit_from_parent(
        &self,
        profile_id: &str,
    ) -> Result<Option<ResolvedCredential>, CredentialError> {
        let Some(parent_path) = self.parent_store_path.as_ref() else {
            return Ok(None);
        };
        if parent_path == &self.store_path {
            return Ok(None);
        }
        let parent = load_auth_profile_store(parent_path)?;
        let now = (self.clock)();
        let Some(credential) = parent
            .profiles
            .get(profile_id)
            .filter(|credential| credential.is_usable_at(now))
            .cloned()
        else {
            return Ok(None);
        };

        let _guard = self.lock_store_file(&self.store_path).await?;
        let mut store = self.load_store()?;
        store
            .profiles
            .insert(profile_id.to_string(), credential.clone());
        save_auth_profile_store(&self.store_path, &store)?;
        tracing::info!(
            profile_id,
            parent = %parent_path.display(),
            "inherited credential from parent scope"
        );
        Ok(Some(resolved(profile_id, &credential, CredentialSource::Parent)))
    }

    pub async fn mark_success(&self, profile_id: &str) -> Result<()> {
        let now = (self.clock)();
        let cooldown = self.cooldown;
        self.mutate_store(|store| {
            cooldown.apply_success(store.stats_mut(profile_id), now);
            Ok(())
        })
        .await
    }

    pub async fn mark_failure(&self, profile_id: &str, reason: AuthFailureReason) -> Result<()> {
        let now = (self.clock)();
        let cooldown = self.cooldown;
        self.mutate_store(|store| {
            cooldown.apply_failure(store.stats_mut(profile_id), reason, now);
            Ok(())
        })
        .await?;
        tracing::info!(profile_id, reason = reason.as_str(), "recorded auth profile failure");
        Ok(())
    }

    /// Inserts or replaces a credential. Re-authentication clears any
    /// disable/cooldown state for the profile.
    pub async fn upsert_profile(&self, profile_id: &str, credential: AuthCredential) -> Result<()> {
        if profile_id.trim().is_empty() {
            bail!("auth profile id must not be empty");
        }
        self.mutate_store(|store| {
            store.profiles.insert(profile_id.to_string(), credential);
            store.usage_stats.remove(profile_id);
            Ok(())
        })
        .await
    }

    pub async fn set_profile_order(&self, provider: &str, order: Vec<String>) -> Result<()> {
        let provider = normalize_provider_id(provider);
        self.mutate_store(|store| {
            if let Some(unknown) = order.iter().find(|id| !store.profiles.contains_key(*id)) {
                bail!("auth profile '{unknown}' not found");
            }
            if order.is_empty() {
                store.order.remove(&provider);
            } else {
                store.order.insert(provider.clone(), order);
            }
            Ok(())
        })
        .await
    }

    /// Redacted status of every profile, in store order.
    pub fn auth_status(&self) -> Result<Vec<AuthProfileStatus>> {
        let now = (self.clock)();
        let store = self.load_store()?;
        Ok(store
            .profiles
            .iter()
            .map(|(profile_id, credential)| {
                let stats = store.usage_stats.get(profile_id).cloned().unwrap_or_default();
                let block = stats.unavailable_until(now);
                let state = match (block, credential.is_usable_at(now)) {
                    (Some((_, AuthFailureReason::Auth | AuthFailureReason::Billing)), _) => {
                        "disabled"
                    }
                    (Some(_), _) => "cooldown",
                    (None, true) => "ready",
                    (None, false) if credential.kind() == CredentialKind::Oauth => "refresh_due",
                    (None, false) => "expired",
                };
                AuthProfileStatus {
                    profile_id: profile_id.clone(),
                    provider: credential.provider().to_string(),
                    kind: credential.kind().as_str(),
                    state,
                    secret_fingerprint: fingerprint(credential.secret()),
                    expires: credential.expires(),
                    unavailable_until: block.map(|(until, _)| until),
                    unavailable_reason: block.map(|(_, reason)| reason),
                    error_count: stats.error_count,
                    last_used: stats.last_used,
                }
            })
            .collect())
    }

    async fn mutate_store(
        &self,
        mutate: impl FnOnce(&mut AuthProfileStore) -> Result<()>,
    ) -> Result<()> {
        let _guard = self.lock_store_file(&self.store_path).await?;
        let mut store = self.load_store()?;
        mutate(&mut store)?;
        save_auth_profile_store(&self.store_path, &store)
    }

    async fn lock_store_file(&self, store_path: &Path) -> Result<FileLockGuard> {
        let lock_path = store_lock_path(store_path);
        let started = SystemTime::now();
        loop {
            if let Some(guard) = try_acquire_file_lock(&lock_path, self.lock_stale)? {
                return Ok(guard);
            }
            let waited = SystemTime::now().duration_since(started).unwrap_or_default();
            if waited >= self.lock_wait {
                bail!("timed out acquiring lock {}", lock_path.display());
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_MS)).await;
        }
    }
}

fn resolved(profile_id: &str, credential: &AuthCredential, source: CredentialSource) -> ResolvedCredential {
    ResolvedCredential {
        profile_id: profile_id.to_string(),
        provider: normalize_provider_id(credential.provider()),
        kind: credential.kind(),
        secret: credential.secret().to_string(),
        expires: credential.expires(),
        source,
    }
}

fn fingerprint(secret: &str) -> String {
    if secret.is_empty() {
        return "empty".to_string();
    }
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().take(4).map(|byte| format!("{byte:02x}")).collect();
    format!("sha256:{hex}")
}
