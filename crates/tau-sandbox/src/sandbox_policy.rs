//! Layered sandbox resolution with provenance and tool allow/deny matching.
use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config_hash::compute_config_hash;
use crate::sandbox_config::{
    SandboxConfig, SandboxMode, SandboxScope, SandboxSettings, WorkspaceAccess,
    DEFAULT_CONTAINER_PREFIX, DEFAULT_SANDBOX_IMAGE, DEFAULT_TOOL_ALLOW, DEFAULT_TOOL_DENY,
    REQUIRED_TOOL_ALLOW,
};

const MAX_CONTAINER_NAME_CHARS: usize = 63;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Which layer supplied a resolved value.
pub enum PolicySource {
    Agent,
    Global,
    Default,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: PolicySource,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `SandboxToolPolicy` used across Tau components.
pub struct SandboxToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub allow_source: PolicySource,
    pub deny_source: PolicySource,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Effective sandbox policy for one run.
pub struct SandboxContext {
    pub enabled: bool,
    pub mode: Resolved<SandboxMode>,
    pub scope: Resolved<SandboxScope>,
    pub workspace_access: Resolved<WorkspaceAccess>,
    pub image: Resolved<String>,
    pub container_name: String,
    pub tools: SandboxToolPolicy,
    pub config_hash: String,
}

#[derive(Debug, Clone, Copy)]
/// Identifies the session a context is resolved for.
pub struct SandboxRequest<'a> {
    pub agent_id: &'a str,
    pub session_key: &'a str,
    pub is_main_session: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EffectiveSandboxConfig<'a> {
    mode: SandboxMode,
    scope: SandboxScope,
    workspace_access: WorkspaceAccess,
    workspace_root: Option<&'a str>,
    image: &'a str,
    network: Option<&'a str>,
    env: Option<&'a BTreeMap<String, String>>,
    tools: EffectiveTools<'a>,
}

#[derive(Serialize)]
struct EffectiveTools<'a> {
    allow: &'a [String],
    deny: &'a [String],
}

/// Resolves agent → global → default. Never fails; missing layers fall back
/// to defaults and the fallback is visible in the provenance fields.
pub fn resolve_sandbox_context(
    settings: &SandboxSettings,
    request: &SandboxRequest<'_>,
) -> SandboxContext {
    let agent = settings.agents.get(request.agent_id);
    let global = &settings.defaults;

    let mode = pick(agent, global, |config| config.mode, SandboxMode::Off);
    let scope = pick(agent, global, |config| config.scope, SandboxScope::Session);
    let workspace_access = pick(
        agent,
        global,
        |config| config.workspace_access,
        WorkspaceAccess::None,
    );
    let image = pick(
        agent,
        global,
        |config| config.image.clone(),
        DEFAULT_SANDBOX_IMAGE.to_string(),
    );
    let prefix = pick(
        agent,
        global,
        |config| config.container_prefix.clone(),
        DEFAULT_CONTAINER_PREFIX.to_string(),
    );
    let workspace_root = pick(agent, global, |config| config.workspace_root.clone().map(Some), None);
    let network = pick(agent, global, |config| config.network.clone().map(Some), None);
    let env = pick(agent, global, |config| config.env.clone().map(Some), None);

    let allow = pick(
        agent,
        global,
        |config| config.tools.as_ref().and_then(|tools| tools.allow.clone()),
        to_strings(DEFAULT_TOOL_ALLOW),
    );
    let deny = pick(
        agent,
        global,
        |config| config.tools.as_ref().and_then(|tools| tools.deny.clone()),
        to_strings(DEFAULT_TOOL_DENY),
    );
    let mut allow_list = normalize_tool_list(allow.value);
    if allow.source != PolicySource::Default && !allow_list.is_empty() {
        for required in REQUIRED_TOOL_ALLOW {
            if !allow_list.iter().any(|existing| existing == required) {
                allow_list.push((*required).to_string());
            }
        }
    }
    let tools = SandboxToolPolicy {
        allow: allow_list,
        deny: normalize_tool_list(deny.value),
        allow_source: allow.source,
        deny_source: deny.source,
    };

    let enabled = match mode.value {
        SandboxMode::Off => false,
        SandboxMode::NonMain => !request.is_main_session,
        SandboxMode::All => true,
    };
    let scope_key = match scope.value {
        SandboxScope::Session => request.session_key.to_string(),
        SandboxScope::Agent => format!("agent:{}", request.agent_id),
        SandboxScope::Shared => "shared".to_string(),
    };
    let container_name = container_name_for(&prefix.value, &scope_key);

    let config_hash = compute_config_hash(&EffectiveSandboxConfig {
        mode: mode.value,
        scope: scope.value,
        workspace_access: workspace_access.value,
        workspace_root: workspace_root.value.as_deref(),
        image: &image.value,
        network: network.value.as_deref(),
        env: env.value.as_ref(),
        tools: EffectiveTools {
            allow: &tools.allow,
            deny: &tools.deny,
        },
    });

    tracing::debug!(
        agent_id = request.agent_id,
        session_key = request.session_key,
        enabled,
        config_hash = %config_hash,
        "resolved sandbox context"
    );

    SandboxContext {
        enabled,
        mode,
        scope,
        workspace_access,
        image,
        container_name,
        tools,
        config_hash,
    }
}

impl SandboxContext {
    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        is_tool_allowed(&self.tools, tool)
    }
}

/// Deny wins over allow. An empty allowlist allows everything not denied.
pub fn is_tool_allowed(policy: &SandboxToolPolicy, tool: &str) -> bool {
    let tool = tool.trim().to_ascii_lowercase();
    if policy
        .deny
        .iter()
        .any(|pattern| tool_pattern_matches(pattern, &tool))
    {
        return false;
    }
    policy.allow.is_empty()
        || policy
            .allow
            .iter()
            .any(|pattern| tool_pattern_matches(pattern, &tool))
}

/// `*` matches any run of characters; everything else is literal.
pub fn tool_pattern_matches(pattern: &str, tool: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == tool;
    }
    let expression = format!(
        "^{}$",
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );
    Regex::new(&expression)
        .map(|regex| regex.is_match(tool))
        .unwrap_or(false)
}

/// `prefix + slug(scope_key) + short digest`, capped at 63 characters.
pub fn container_name_for(prefix: &str, scope_key: &str) -> String {
    let mut slug = String::new();
    for ch in scope_key.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "default" } else { slug };
    let digest = Sha256::digest(scope_key.as_bytes());
    let suffix: String = digest.iter().take(4).map(|byte| format!("{byte:02x}")).collect();

    let budget = MAX_CONTAINER_NAME_CHARS
        .saturating_sub(prefix.chars().count())
        .saturating_sub(suffix.len() + 1);
    let slug: String = slug.chars().take(budget).collect();
    let slug = slug.trim_end_matches('-');
    let name = format!("{prefix}{slug}-{suffix}");
    name.chars().take(MAX_CONTAINER_NAME_CHARS).collect()
}

fn pick<T>(
    agent: Option<&SandboxConfig>,
    global: &SandboxConfig,
    field: impl Fn(&SandboxConfig) -> Option<T>,
    default: T,
) -> Resolved<T> {
    if let Some(value) = agent.and_then(&field) {
        return Resolved {
            value,
            source: PolicySource::Agent,
        };
    }
    if let Some(value) = field(global) {
        return Resolved {
            value,
            source: PolicySource::Global,
        };
    }
    Resolved {
        value: default,
        source: PolicySource::Default,
    }
}

fn normalize_tool_list(tools: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tools.len());
    for tool in tools {
        let tool = tool.trim().to_ascii_lowercase();
        if !tool.is_empty() && !normalized.contains(&tool) {
            normalized.push(tool);
        }
    }
    normalized
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
