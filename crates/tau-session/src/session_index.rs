//! Session index (`sessions.json`): one `SessionEntry` per session key.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tau_core::{acquire_file_lock, current_unix_timestamp_ms, write_text_atomic, ClockFn};

const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthProfileOverrideSource {
    Auto,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElevatedLevel {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Outcome of the most recent agent run for a session.
pub enum RunStatus {
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Persistent per-session routing and budget state.
///
/// Model and provider fields are private: changing either clears the pinned
/// auth profile, so the only mutators are `set_model` and `set_provider_override`.
pub struct SessionEntry {
    pub session_id: String,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_profile_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_profile_override_source: Option<AuthProfileOverrideSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_profile_override_compaction_count: Option<u64>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub compaction_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_flush_compaction_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevated_level: Option<ElevatedLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default)]
    pub aborted_last_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            session_id: session_id.into(),
            updated_at: now_ms,
            ..Self::default()
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn provider_override(&self) -> Option<&str> {
        self.provider_override.as_deref()
    }

    pub fn auth_profile_override(&self) -> Option<&str> {
        self.auth_profile_override.as_deref()
    }

    pub fn auth_profile_override_source(&self) -> Option<AuthProfileOverrideSource> {
        self.auth_profile_override_source
    }

    pub fn auth_profile_override_compaction_count(&self) -> Option<u64> {
        self.auth_profile_override_compaction_count
    }

    /// Returns true when the pin was chosen explicitly by the user.
    pub fn has_user_auth_override(&self) -> bool {
        self.auth_profile_override.is_some()
            && self.auth_profile_override_source == Some(AuthProfileOverrideSource::User)
    }

    pub fn set_model(&mut self, model: Option<String>) {
        if self.model != model {
            self.model = model;
            self.clear_auth_profile_override();
        }
    }

    pub fn set_provider_override(&mut self, provider: Option<String>) {
        if self.provider_override != provider {
            self.provider_override = provider;
            self.clear_auth_profile_override();
        }
    }

    pub fn set_auth_profile_override(
        &mut self,
        profile_id: impl Into<String>,
        source: AuthProfileOverrideSource,
    ) {
        self.auth_profile_override = Some(profile_id.into());
        self.auth_profile_override_source = Some(source);
        self.auth_profile_override_compaction_count = Some(self.compaction_count);
    }

    pub fn clear_auth_profile_override(&mut self) {
        self.auth_profile_override = None;
        self.auth_profile_override_source = None;
        self.auth_profile_override_compaction_count = None;
    }

    /// Adds usage from one run; totals track the most recent context size.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.total_tokens = input_tokens.saturating_add(output_tokens);
    }
}

#[derive(Clone)]
/// Public struct `SessionIndexStore` used across Tau components.
pub struct SessionIndexStore {
    path: PathBuf,
    lock_wait: Duration,
    lock_stale: Duration,
    clock: ClockFn,
    write_gate: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SessionIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIndexStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SessionIndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            lock_stale: Duration::from_millis(DEFAULT_LOCK_STALE_MS),
            clock: Arc::new(current_unix_timestamp_ms),
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, SessionEntry>> {
        read_index(&self.path)
    }

    pub fn get(&self, session_key: &str) -> Result<Option<SessionEntry>> {
        Ok(read_index(&self.path)?.remove(session_key))
    }

    /// Returns the entry for `session_key`, creating and persisting it if absent.
    pub fn get_or_create(&self, session_key: &str) -> Result<SessionEntry> {
        if let Some(entry) = self.get(session_key)? {
            return Ok(entry);
        }
        self.update(session_key, |_| {})
    }

    /// Locked read-modify-write of one entry. Missing entries are created first.
    pub fn update(
        &self,
        session_key: &str,
        mutate: impl FnOnce(&mut SessionEntry),
    ) -> Result<SessionEntry> {
        let _gate = lock_or_recover_mutex(&self.write_gate);
        let _guard = acquire_file_lock(&self.lock_path(), self.lock_wait, self.lock_stale)?;
        let mut index = read_index(&self.path)?;
        let now = (self.clock)();
        let entry = index
            .entry(session_key.to_string())
            .or_insert_with(|| SessionEntry::new(generate_session_id(session_key, now), now));
        mutate(entry);
        entry.updated_at = now;
        let updated = entry.clone();
        write_index(&self.path, &index)?;
        Ok(updated)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }
}

fn lock_or_recover_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn generate_session_id(session_key: &str, now_ms: u64) -> String {
    let digest = Sha256::digest(format!("{session_key}:{now_ms}:{}", std::process::id()));
    digest
        .iter()
        .take(12)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn read_index(path: &Path) -> Result<BTreeMap<String, SessionEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BTreeMap::new());
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read session index {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse session index {}", path.display()))
}

fn write_index(path: &Path, index: &BTreeMap<String, SessionEntry>) -> Result<()> {
    let mut encoded =
        serde_json::to_string_pretty(index).context("failed to encode session index")?;
    encoded.push('\n');
    write_text_atomic(path, &encoded)
}
