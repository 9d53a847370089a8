//! Stable session keys: `agent:{agent}:{channel}:{account}:{peer}`.

pub const MAIN_SESSION_SUFFIX: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `SessionKeyParts` used across Tau components.
pub struct SessionKeyParts {
    pub agent_id: String,
    pub channel: Option<String>,
}

/// Builds the lowercase session key for one conversation peer.
pub fn resolve_session_key(agent_id: &str, channel: &str, account: &str, peer: &str) -> String {
    format!(
        "agent:{}:{}:{}:{}",
        normalize_segment(agent_id),
        normalize_segment(channel),
        normalize_segment(account),
        normalize_segment(peer)
    )
}

/// Key of the agent's main (operator) session.
pub fn main_session_key(agent_id: &str) -> String {
    format!("agent:{}:{MAIN_SESSION_SUFFIX}", normalize_segment(agent_id))
}

pub fn parse_session_key(session_key: &str) -> Option<SessionKeyParts> {
    let mut segments = session_key.split(':');
    if segments.next()? != "agent" {
        return None;
    }
    let agent_id = segments.next().filter(|value| !value.is_empty())?;
    let channel = segments
        .next()
        .filter(|value| !value.is_empty() && *value != MAIN_SESSION_SUFFIX)
        .map(str::to_string);
    Some(SessionKeyParts {
        agent_id: agent_id.to_string(),
        channel,
    })
}

fn normalize_segment(raw: &str) -> String {
    let normalized = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| if ch == ':' || ch.is_whitespace() { '_' } else { ch })
        .collect::<String>();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}
