//! Append-only JSONL journal per session with lock-guarded writes.
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tau_core::{acquire_file_lock, current_unix_timestamp_ms, ClockFn};

use crate::journal_records::{
    CompactionRecord, CustomRecord, JournalMessage, JournalRecord, MessageRecord, SessionHeader,
    JOURNAL_SCHEMA_VERSION,
};
use crate::journal_repair::{repair_session_file_if_needed, JournalRepairReport};

const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;
const MAX_FILE_STEM_CHARS: usize = 80;

#[derive(Debug, Clone, Default, PartialEq)]
/// Records parsed from a journal plus the count of lines that failed to parse.
pub struct JournalReadResult {
    pub records: Vec<JournalRecord>,
    pub skipped_lines: usize,
}

#[derive(Debug, Clone, PartialEq)]
/// A record to append; ids, parents and timestamps are assigned by the store.
pub enum NewJournalEntry {
    Message(JournalMessage),
    Custom {
        custom_type: String,
        data: Value,
    },
    Compaction {
        summary: String,
        first_kept_entry_id: Option<u64>,
        tokens_before: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Message history visible to the next run: everything after the latest compaction.
pub struct JournalContext {
    pub summary: Option<String>,
    pub messages: Vec<(u64, JournalMessage)>,
}

impl JournalContext {
    pub fn into_messages(self) -> Vec<JournalMessage> {
        self.messages.into_iter().map(|(_, message)| message).collect()
    }
}

#[derive(Clone)]
/// Public struct `SessionJournalStore` used across Tau components.
pub struct SessionJournalStore {
    root: PathBuf,
    lock_wait: Duration,
    lock_stale: Duration,
    clock: ClockFn,
}

impl std::fmt::Debug for SessionJournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionJournalStore")
            .field("root", &self.root)
            .field("lock_wait", &self.lock_wait)
            .field("lock_stale", &self.lock_stale)
            .finish()
    }
}

impl SessionJournalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            lock_stale: Duration::from_millis(DEFAULT_LOCK_STALE_MS),
            clock: std::sync::Arc::new(current_unix_timestamp_ms),
        }
    }

    pub fn with_lock_policy(mut self, wait_ms: u64, stale_ms: u64) -> Self {
        self.lock_wait = Duration::from_millis(wait_ms.max(1));
        self.lock_stale = Duration::from_millis(stale_ms);
        self
    }

    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a session key to a stable, filesystem-safe journal path.
    pub fn journal_path(&self, session_key: &str) -> PathBuf {
        let mut stem: String = session_key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .take(MAX_FILE_STEM_CHARS)
            .collect();
        if stem.is_empty() {
            stem.push_str("session");
        }
        let digest = Sha256::digest(session_key.as_bytes());
        let suffix: String = digest
            .iter()
            .take(4)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        self.root.join(format!("{stem}-{suffix}.jsonl"))
    }

    /// Appends one record and returns its entry id.
    pub fn append(&self, session_key: &str, entry: NewJournalEntry) -> Result<u64> {
        let ids = self.append_batch(session_key, std::slice::from_ref(&entry))?;
        ids.first()
            .copied()
            .ok_or_else(|| anyhow!("journal append produced no entry id"))
    }

    /// Appends messages in order, chaining `parent_id` to the previous message.
    pub fn append_messages(
        &self,
        session_key: &str,
        messages: &[JournalMessage],
    ) -> Result<Vec<u64>> {
        let entries: Vec<NewJournalEntry> = messages
            .iter()
            .cloned()
            .map(NewJournalEntry::Message)
            .collect();
        self.append_batch(session_key, &entries)
    }

    pub fn append_custom(&self, session_key: &str, custom_type: &str, data: Value) -> Result<u64> {
        self.append(
            session_key,
            NewJournalEntry::Custom {
                custom_type: custom_type.to_string(),
                data,
            },
        )
    }

    pub fn append_compaction(
        &self,
        session_key: &str,
        summary: &str,
        first_kept_entry_id: Option<u64>,
        tokens_before: u64,
    ) -> Result<u64> {
        self.append(
            session_key,
            NewJournalEntry::Compaction {
                summary: summary.to_string(),
                first_kept_entry_id,
                tokens_before,
            },
        )
    }

    /// Writes all entries under one lock hold so ids stay contiguous.
    pub fn append_batch(&self, session_key: &str, entries: &[NewJournalEntry]) -> Result<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        self.with_locked_journal(session_key, |path, state| {
            let now = (self.clock)();
            let mut ids = Vec::with_capacity(entries.len());
            let mut records = Vec::with_capacity(entries.len());
            for entry in entries {
                let id = state.next_id();
                records.push(match entry {
                    NewJournalEntry::Message(message) => {
                        let parent_id = state.last_message_id.replace(id);
                        JournalRecord::Message(MessageRecord {
                            id,
                            parent_id,
                            timestamp: now,
                            message: message.clone(),
                        })
                    }
                    NewJournalEntry::Custom { custom_type, data } => {
                        JournalRecord::Custom(CustomRecord {
                            id,
                            custom_type: custom_type.clone(),
                            data: data.clone(),
                            timestamp: now,
                        })
                    }
                    NewJournalEntry::Compaction {
                        summary,
                        first_kept_entry_id,
                        tokens_before,
                    } => JournalRecord::Compaction(CompactionRecord {
                        id,
                        timestamp: now,
                        summary: summary.clone(),
                        first_kept_entry_id: *first_kept_entry_id,
                        tokens_before: *tokens_before,
                    }),
                });
                ids.push(id);
            }
            append_records(path, &records)?;
            Ok(ids)
        })
    }

    /// Reads every parseable record; malformed lines are counted and skipped.
    pub fn read_entries(&self, session_key: &str) -> Result<JournalReadResult> {
        read_journal_file(&self.journal_path(session_key))
    }

    /// Builds the history view that follows the latest compaction record.
    pub fn context(&self, session_key: &str) -> Result<JournalContext> {
        let read = self.read_entries(session_key)?;
        Ok(context_from_records(&read.records))
    }

    /// Newest custom record of the given type.
    pub fn latest_custom(&self, session_key: &str, custom_type: &str) -> Result<Option<CustomRecord>> {
        let read = self.read_entries(session_key)?;
        Ok(read.records.into_iter().rev().find_map(|record| match record {
            JournalRecord::Custom(custom) if custom.custom_type == custom_type => Some(custom),
            _ => None,
        }))
    }

    pub fn repair_if_needed(&self, session_key: &str) -> Result<JournalRepairReport> {
        let path = self.journal_path(session_key);
        let _guard = acquire_file_lock(&lock_path_for(&path), self.lock_wait, self.lock_stale)?;
        Ok(repair_session_file_if_needed(&path))
    }

    fn with_locked_journal<T>(
        &self,
        session_key: &str,
        operation: impl FnOnce(&Path, &mut JournalWriteState) -> Result<T>,
    ) -> Result<T> {
        let path = self.journal_path(session_key);
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create journal directory {}", self.root.display()))?;
        let _guard = acquire_file_lock(&lock_path_for(&path), self.lock_wait, self.lock_stale)?;

        let existing = read_journal_file(&path)?;
        let has_header = matches!(existing.records.first(), Some(JournalRecord::Session(_)));
        if !has_header {
            if existing.records.is_empty() {
                append_records(
                    &path,
                    &[JournalRecord::Session(SessionHeader {
                        version: JOURNAL_SCHEMA_VERSION,
                        id: session_key.to_string(),
                        timestamp: (self.clock)(),
                    })],
                )?;
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "session journal has no header; appending without one"
                );
            }
        }
        let mut state = JournalWriteState::from_records(&existing.records);
        operation(&path, &mut state)
    }
}

#[derive(Debug, Default)]
struct JournalWriteState {
    max_id: u64,
    last_message_id: Option<u64>,
}

impl JournalWriteState {
    fn from_records(records: &[JournalRecord]) -> Self {
        let mut state = Self::default();
        for record in records {
            if let Some(id) = record.entry_id() {
                state.max_id = state.max_id.max(id);
            }
            if let JournalRecord::Message(message) = record {
                state.last_message_id = Some(message.id);
            }
        }
        state
    }

    fn next_id(&mut self) -> u64 {
        self.max_id += 1;
        self.max_id
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    path.with_extension("jsonl.lock")
}

fn append_records(path: &Path, records: &[JournalRecord]) -> Result<()> {
    let mut encoded = String::new();
    // A torn trailing line must stay on its own line or repair would take
    // the new record with it.
    if !ends_with_newline_or_empty(path)? {
        encoded.push('\n');
    }
    for record in records {
        encoded.push_str(&serde_json::to_string(record).context("failed to encode journal record")?);
        encoded.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open session journal {}", path.display()))?;
    file.write_all(encoded.as_bytes())
        .with_context(|| format!("failed to append to session journal {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync session journal {}", path.display()))?;
    Ok(())
}

fn ends_with_newline_or_empty(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to open session journal {}", path.display()))
        }
    };
    let len = file
        .metadata()
        .with_context(|| format!("failed to stat session journal {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .with_context(|| format!("failed to read session journal tail {}", path.display()))?;
    Ok(last[0] == b'\n')
}

pub(crate) fn read_journal_file(path: &Path) -> Result<JournalReadResult> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(JournalReadResult::default());
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read session journal {}", path.display()));
        }
    };

    let mut result = JournalReadResult::default();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => result.records.push(record),
            Err(_) => result.skipped_lines += 1,
        }
    }
    if result.skipped_lines > 0 {
        tracing::debug!(
            path = %path.display(),
            skipped = result.skipped_lines,
            "skipped malformed journal lines"
        );
    }
    Ok(result)
}

pub(crate) fn context_from_records(records: &[JournalRecord]) -> JournalContext {
    let latest_compaction = records.iter().rev().find_map(|record| match record {
        JournalRecord::Compaction(compaction) => Some(compaction),
        _ => None,
    });
    let first_visible_id = latest_compaction
        .map(|compaction| {
            compaction
                .first_kept_entry_id
                .unwrap_or(compaction.id.saturating_add(1))
        })
        .unwrap_or(0);

    JournalContext {
        summary: latest_compaction.map(|compaction| compaction.summary.clone()),
        messages: records
            .iter()
            .filter_map(|record| match record {
                JournalRecord::Message(message) if message.id >= first_visible_id => {
                    Some((message.id, message.message.clone()))
                }
                _ => None,
            })
            .collect(),
    }
}
