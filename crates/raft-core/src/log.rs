//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, mirrored to disk via raft-storage
//! what: LogEntry struct, Log with log-matching lookups and suffix replacement

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::{Index, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: Index,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: Index, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// Create the empty entry a leader appends when it takes office
    pub fn noop(term: Term, index: Index) -> Self {
        Self::new(term, index, Vec::new())
    }

    /// Leader no-op entries carry no command
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// The ordered, densely indexed sequence of entries held by one node.
///
/// Index 0 is a sentinel with term 0 that every log "contains", so an
/// AppendEntries with `prev_log_index == 0` always passes the matching check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries. They must be numbered 1..=n with
    /// non-decreasing terms.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, RaftError> {
        let mut prev_term = 0;
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as Index + 1;
            if entry.index != expected {
                return Err(RaftError::CorruptLog(format!(
                    "expected index {expected}, found {}",
                    entry.index
                )));
            }
            if entry.term < prev_term {
                return Err(RaftError::CorruptLog(format!(
                    "term regression at index {}: {} after {prev_term}",
                    entry.index, entry.term
                )));
            }
            prev_term = entry.term;
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last_index(&self) -> Index {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, with the sentinel at 0.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// The log-matching check: do we hold an entry at `index` with `term`?
    pub fn matches(&self, index: Index, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Up to `max` entries starting at `from` (inclusive).
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].iter().take(max).cloned().collect()
    }

    /// Append a command at the next index in the given term.
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> &LogEntry {
        let entry = LogEntry::new(term, self.last_index() + 1, command);
        self.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Push an already numbered entry. Its index must be the next one.
    pub fn push(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index() + 1,
            "log entries must be densely indexed"
        );
        assert!(entry.term >= self.last_term(), "log terms must not regress");
        self.entries.push(entry);
    }

    /// Drop every entry at `index` and above.
    pub fn truncate_from(&mut self, index: Index) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// First index holding `term`, scanning back from `from`.
    pub fn first_index_of_term(&self, term: Term, from: Index) -> Index {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last index holding `term`, if the log has any entry of that term.
    pub fn last_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .take_while(|e| e.term == term)
            .map(|e| e.index)
            .next()
    }

    /// Whether a log ending at `(last_log_index, last_log_term)` is at least
    /// as up to date as ours: lexicographic on (term, index).
    pub fn is_up_to_date(&self, last_log_index: Index, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }
}
