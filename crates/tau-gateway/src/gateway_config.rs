use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tau_dispatch::DispatcherConfig;
use tau_provider::{CooldownPolicy, OAuthRefreshConfig};

use crate::cli_args::Cli;

const SESSIONS_DIR: &str = "sessions";
const SESSION_INDEX_FILE: &str = "sessions.json";
const AUTH_STORE_FILE: &str = "auth-profiles.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
/// Public struct `AuthConfig` used across Tau components.
pub(crate) struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_store_path: Option<PathBuf>,
    pub cooldown: CooldownPolicy,
    pub oauth: OAuthRefreshConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
/// Public struct `GatewayConfig` used across Tau components.
pub(crate) struct GatewayConfig {
    pub dispatcher: DispatcherConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// On-disk locations derived from the state directory.
pub(crate) struct GatewayPaths {
    pub sessions_dir: PathBuf,
    pub session_index: PathBuf,
    pub auth_store: PathBuf,
    pub parent_auth_store: Option<PathBuf>,
}

impl GatewayPaths {
    pub(crate) fn resolve(state_dir: &Path, config: &GatewayConfig, cli: &Cli) -> Self {
        let auth_store = cli
            .auth_store
            .clone()
            .or_else(|| config.auth.store_path.clone())
            .unwrap_or_else(|| state_dir.join(AUTH_STORE_FILE));
        let parent_auth_store = cli
            .parent_auth_store
            .clone()
            .or_else(|| config.auth.parent_store_path.clone());
        Self {
            sessions_dir: state_dir.join(SESSIONS_DIR),
            session_index: state_dir.join(SESSION_INDEX_FILE),
            auth_store,
            parent_auth_store,
        }
    }
}

/// Reads the gateway config. A missing `--config` means built-in defaults;
/// a path that was given but cannot be read is an error.
pub(crate) fn load_gateway_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read gateway config {}", path.display()))?;
    parse_gateway_config(&raw)
        .with_context(|| format!("failed to parse gateway config {}", path.display()))
}

pub(crate) fn parse_gateway_config(raw: &str) -> Result<GatewayConfig> {
    if raw.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }
    Ok(serde_json::from_str::<GatewayConfig>(raw)?)
}

pub(crate) fn apply_cli_overrides(config: &mut GatewayConfig, cli: &Cli) {
    if let Some(agent_id) = cli.agent_id.as_deref().map(str::trim) {
        if !agent_id.is_empty() {
            config.dispatcher.agent_id = agent_id.to_string();
        }
    }
}
