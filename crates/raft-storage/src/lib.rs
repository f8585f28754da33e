//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: drains the durable write queue of raft-core, loaded by raft-runtime on startup
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use raft_core::{DurableWrite, Index, LogEntry, NodeId, Term};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// trait for durable storage of raft state
///
/// every method returns only once the change is durable; a node must not
/// acknowledge a vote or an append before the matching call has returned.
pub trait Storage {
    /// persist the current term together with the vote cast in it
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)>;

    /// append entries to the log; an entry replaces anything already stored
    /// at or after its index
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// entries from `from_index` (inclusive) to the end of the log
    fn read_log(&self, from_index: Index) -> Result<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: Index) -> Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>> {
        self.read_log(1)
    }

    /// Make a batch of queued core writes durable, in order.
    fn apply(&mut self, writes: Vec<DurableWrite>) -> Result<()> {
        for write in writes {
            match write {
                DurableWrite::TermAndVote { term, voted_for } => {
                    self.save_term_and_vote(term, voted_for)?
                }
                DurableWrite::Append(entries) => self.append_entries(&entries)?,
                DurableWrite::TruncateFrom(index) => self.truncate_log_from(index)?,
            }
        }
        Ok(())
    }
}

/// Drop stored entries the new batch supersedes, then add it.
fn splice(log: &mut Vec<LogEntry>, entries: &[LogEntry]) {
    if let Some(first) = entries.first() {
        log.retain(|e| e.index < first.index);
        log.extend(entries.iter().cloned());
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for
/// - log.json: array of log entries
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// atomic write: write to temp file, sync, then rename over the target
    fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<()> {
        let temp_path = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(name))?;
        // make the rename itself durable
        sync_dir(&self.dir)
    }

    fn read_file(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(Some(contents))
    }

    fn write_log(&self, log: &[LogEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(log)?;
        self.write_atomic("log.json", &json)
    }
}

/// fsync a directory so renames inside it survive a crash
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// directories cannot be opened as files here; the rename is all we get
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&MetaData { term, voted_for })?;
        self.write_atomic("meta.json", &json)
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        let Some(contents) = Self::read_file(&self.meta_path())? else {
            return Ok((0, None)); // default for new nodes
        };
        let meta: MetaData = serde_json::from_str(&contents)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // write entire log (simple approach - could optimize with append-only file)
        let mut log = self.load_log()?;
        splice(&mut log, entries);
        self.write_log(&log)
    }

    fn read_log(&self, from_index: Index) -> Result<Vec<LogEntry>> {
        let Some(contents) = Self::read_file(&self.log_path())? else {
            return Ok(Vec::new());
        };
        let mut log: Vec<LogEntry> = serde_json::from_str(&contents)?;
        log.retain(|e| e.index >= from_index);
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: Index) -> Result<()> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);
        if log.len() == before {
            return Ok(());
        }
        self.write_log(&log)
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory; clone it before dropping a node to simulate
/// a restart that keeps the disk
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        splice(&mut self.log, entries);
        Ok(())
    }

    fn read_log(&self, from_index: Index) -> Result<Vec<LogEntry>> {
        Ok(self
            .log
            .iter()
            .filter(|e| e.index >= from_index)
            .cloned()
            .collect())
    }

    fn truncate_log_from(&mut self, from_index: Index) -> Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }
}
