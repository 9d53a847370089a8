//! Durable session state for the Tau gateway.
//!
//! Each session key owns an append-only JSONL journal (header, messages,
//! custom markers, compaction records) and one entry in the shared
//! `sessions.json` index. Journals that were truncated mid-write can be
//! repaired in place; the original bytes are always kept as a backup.

mod journal_records;
mod journal_repair;
mod journal_store;
mod session_index;

pub use journal_records::{
    is_session_header, CompactionRecord, ContentBlock, CustomRecord, JournalMessage,
    JournalRecord, MessageRecord, MessageRole, SessionHeader, JOURNAL_SCHEMA_VERSION,
};
pub use journal_repair::{repair_session_file_if_needed, JournalRepairIssue, JournalRepairReport};
pub use journal_store::{JournalContext, JournalReadResult, NewJournalEntry, SessionJournalStore};
pub use session_index::{
    AuthProfileOverrideSource, ElevatedLevel, RunStatus, SessionEntry, SessionIndexStore,
};
