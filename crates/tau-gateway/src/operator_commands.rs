//! Operator-facing subcommands: journal repair, sandbox inspection and
//! credential status.
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tau_dispatch::{main_session_key, parse_session_key};
use tau_provider::{AuthProfileResolver, AuthProfileStatus};
use tau_sandbox::{resolve_sandbox_context, SandboxContext, SandboxRequest, SandboxSettings};
use tau_session::{JournalRepairIssue, JournalRepairReport, SessionJournalStore};

pub(crate) fn run_journal_repair(journal: &SessionJournalStore, session_key: &str) -> Result<Value> {
    if parse_session_key(session_key).is_none() {
        return Err(anyhow!("invalid session key '{session_key}'"));
    }
    let report = journal.repair_if_needed(session_key)?;
    if report.repaired {
        tracing::info!(
            session_key = %session_key,
            dropped_lines = report.dropped_lines,
            "repaired session journal"
        );
    }
    Ok(render_repair_report(
        session_key,
        &journal.journal_path(session_key).display().to_string(),
        &report,
    ))
}

pub(crate) fn render_repair_report(session_key: &str, path: &str, report: &JournalRepairReport) -> Value {
    let detail = match &report.issue {
        Some(JournalRepairIssue::ReadFailed(message) | JournalRepairIssue::RepairFailed(message)) => {
            Some(message.clone())
        }
        _ => None,
    };
    json!({
        "sessionKey": session_key,
        "path": path,
        "repaired": report.repaired,
        "droppedLines": report.dropped_lines,
        "backupPath": report.backup_path.as_ref().map(|path| path.display().to_string()),
        "issue": report.issue.as_ref().map(JournalRepairIssue::as_str),
        "detail": detail,
    })
}

/// Resolves the sandbox context a run in `session_key` would get. Without a
/// key the agent's main session is inspected.
pub(crate) fn run_sandbox_inspect(
    settings: &SandboxSettings,
    default_agent_id: &str,
    session_key: Option<&str>,
) -> Result<SandboxContext> {
    let session_key = session_key
        .map(str::to_string)
        .unwrap_or_else(|| main_session_key(default_agent_id));
    let parts = parse_session_key(&session_key)
        .ok_or_else(|| anyhow!("invalid session key '{session_key}'"))?;
    Ok(resolve_sandbox_context(
        settings,
        &SandboxRequest {
            agent_id: &parts.agent_id,
            session_key: &session_key,
            is_main_session: session_key == main_session_key(&parts.agent_id),
        },
    ))
}

pub(crate) fn run_auth_status(resolver: &AuthProfileResolver, as_json: bool) -> Result<String> {
    let rows = resolver.auth_status()?;
    if as_json {
        return Ok(serde_json::to_string_pretty(&rows)?);
    }
    Ok(render_auth_status_table(&rows))
}

pub(crate) fn render_auth_status_table(rows: &[AuthProfileStatus]) -> String {
    if rows.is_empty() {
        return "no auth profiles configured".to_string();
    }
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format!(
        "{:<28} {:<10} {:<8} {:<12} {:<16} {:>6}",
        "profile", "provider", "kind", "state", "fingerprint", "errors"
    ));
    for row in rows {
        let mut line = format!(
            "{:<28} {:<10} {:<8} {:<12} {:<16} {:>6}",
            row.profile_id, row.provider, row.kind, row.state, row.secret_fingerprint, row.error_count
        );
        if let (Some(until), Some(reason)) = (row.unavailable_until, row.unavailable_reason) {
            line.push_str(&format!(" until={until} reason={reason}"));
        }
        lines.push(line);
    }
    lines.join("\n")
}
