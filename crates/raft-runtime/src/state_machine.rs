//! # state_machine
//!
//! why: committed commands only reach application state through `apply`
//! relations: invoked by the node actor in index order, once per committed entry
//! what: StateMachine trait, KvCommand encoding, KvStore

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use raft_core::{Index, LogEntry};

/// Application callback. Called exactly once per committed index, in
/// increasing index order, including the leaders' no-op entries
/// (see [`LogEntry::is_noop`]). On start the node asks [`applied_index`]
/// where the state machine left off and resumes after it, so a state machine
/// that survives a restart never sees an index twice.
///
/// [`applied_index`]: StateMachine::applied_index
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);

    /// Highest index already applied; 0 rebuilds from the start of the log.
    fn applied_index(&self) -> Index {
        0
    }
}

/// Commands understood by [`KvStore`]: `SET <key> <value>` and `DEL <key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Set { key: String, value: String },
    Del { key: String },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        KvCommand::Del { key: key.into() }
    }

    pub fn parse(command: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(command).ok()?;
        let mut parts = text.splitn(3, ' ');
        match (parts.next()?, parts.next(), parts.next()) {
            ("SET", Some(key), Some(value)) if !key.is_empty() => Some(Self::set(key, value)),
            ("DEL", Some(key), None) if !key.is_empty() => Some(Self::del(key)),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for KvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvCommand::Set { key, value } => write!(f, "SET {key} {value}"),
            KvCommand::Del { key } => write!(f, "DEL {key}"),
        }
    }
}

#[derive(Debug, Default)]
struct KvState {
    data: BTreeMap<String, String>,
    last_applied: Index,
}

/// In-memory key-value map. Cloning shares the map, so a caller can keep a
/// read handle while the node actor owns the applying copy.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    state: Arc<RwLock<KvState>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.data.get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.data.clone()
    }

    pub fn last_applied(&self) -> Index {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_applied
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, entry: &LogEntry) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(entry.index, state.last_applied + 1, "entries applied out of order");
        state.last_applied = entry.index;
        if entry.is_noop() {
            return;
        }
        match KvCommand::parse(&entry.command) {
            Some(KvCommand::Set { key, value }) => {
                state.data.insert(key, value);
            }
            Some(KvCommand::Del { key }) => {
                state.data.remove(&key);
            }
            None => tracing::warn!(index = entry.index, "Skipping unrecognized command"),
        }
    }

    fn applied_index(&self) -> Index {
        self.last_applied()
    }
}
