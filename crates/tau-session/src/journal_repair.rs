//! Recovery of session journals that contain truncated or malformed lines.
use std::path::{Path, PathBuf};

use serde_json::Value;
use tau_core::{current_unix_timestamp_ms, write_text_atomic_preserving_permissions};

use crate::journal_records::is_session_header;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `JournalRepairIssue` values.
pub enum JournalRepairIssue {
    MissingFile,
    EmptyFile,
    InvalidHeader,
    MalformedLines,
    ReadFailed(String),
    RepairFailed(String),
}

impl JournalRepairIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalRepairIssue::MissingFile => "missing-file",
            JournalRepairIssue::EmptyFile => "empty-file",
            JournalRepairIssue::InvalidHeader => "invalid-header",
            JournalRepairIssue::MalformedLines => "malformed-lines",
            JournalRepairIssue::ReadFailed(_) => "read-failed",
            JournalRepairIssue::RepairFailed(_) => "repair-failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Outcome of `repair_session_file_if_needed`.
pub struct JournalRepairReport {
    pub repaired: bool,
    pub dropped_lines: usize,
    pub backup_path: Option<PathBuf>,
    pub issue: Option<JournalRepairIssue>,
}

impl JournalRepairReport {
    fn with_issue(issue: JournalRepairIssue) -> Self {
        Self {
            issue: Some(issue),
            ..Self::default()
        }
    }
}

/// Drops unparseable lines from a journal, keeping a backup of the original.
///
/// A file whose first parseable entry is not a session header is left
/// untouched and reported as `invalid-header`.
pub fn repair_session_file_if_needed(path: &Path) -> JournalRepairReport {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return JournalRepairReport::with_issue(JournalRepairIssue::MissingFile);
        }
        Err(error) => {
            return JournalRepairReport::with_issue(JournalRepairIssue::ReadFailed(
                error.to_string(),
            ));
        }
    };

    let mut kept_lines = Vec::new();
    let mut dropped_lines = 0usize;
    let mut first_entry: Option<Value> = None;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                if first_entry.is_none() {
                    first_entry = Some(value);
                }
                kept_lines.push(line);
            }
            Err(_) => dropped_lines += 1,
        }
    }

    let Some(first_entry) = first_entry else {
        return JournalRepairReport {
            dropped_lines,
            ..JournalRepairReport::with_issue(JournalRepairIssue::EmptyFile)
        };
    };
    if !is_session_header(&first_entry) {
        return JournalRepairReport {
            dropped_lines,
            ..JournalRepairReport::with_issue(JournalRepairIssue::InvalidHeader)
        };
    }
    if dropped_lines == 0 {
        return JournalRepairReport::default();
    }
    // Only unparseable lines are removed; every parseable line is kept verbatim.

    let backup_path = backup_path_for(path);
    if let Err(error) = std::fs::write(&backup_path, &content) {
        return JournalRepairReport {
            dropped_lines,
            ..JournalRepairReport::with_issue(JournalRepairIssue::RepairFailed(format!(
                "failed to write backup {}: {error}",
                backup_path.display()
            )))
        };
    }

    let mut cleaned = kept_lines.join("\n");
    cleaned.push('\n');
    if let Err(error) = write_text_atomic_preserving_permissions(path, &cleaned) {
        return JournalRepairReport {
            dropped_lines,
            backup_path: Some(backup_path),
            ..JournalRepairReport::with_issue(JournalRepairIssue::RepairFailed(format!(
                "{error:#}"
            )))
        };
    }

    tracing::warn!(
        path = %path.display(),
        dropped_lines,
        backup = %backup_path.display(),
        "repaired session journal"
    );
    JournalRepairReport {
        repaired: true,
        dropped_lines,
        backup_path: Some(backup_path),
        issue: Some(JournalRepairIssue::MalformedLines),
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "session.jsonl".to_string());
    path.with_file_name(format!(
        "{file_name}.bak-{}-{}",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}
