//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: election.rs and replication.rs add the rpc handlers, raft-runtime drives it
//! what: NodeState enum, RaftNode struct, durable write queue, status snapshot
//!
//! The node is pure: it never performs I/O and never reads a clock. Every
//! change to term, vote or log is queued as a [`DurableWrite`]; the caller must
//! drain the queue with [`RaftNode::take_writes`] and make it durable before
//! any response or outgoing message produced by the same call leaves the node.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterView;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::{Log, LogEntry};
use crate::replication::Replication;
use crate::{Index, NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// A change that must reach the durable store before the node acknowledges
/// anything that depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableWrite {
    TermAndVote { term: Term, voted_for: Option<NodeId> },
    Append(Vec<LogEntry>),
    TruncateFrom(Index),
}

/// Observability snapshot returned by `Status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    pub cluster: ClusterView,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: Log,
    pub commit_index: Index,
    pub last_applied: Index,
    /// Known leader for the current term, used as a redirect hint
    pub leader_id: Option<NodeId>,
    /// Votes granted to us in the current election
    pub votes_received: BTreeSet<NodeId>,
    /// Replication cursors, present only while leader
    pub replication: Option<Replication>,
    writes: Vec<DurableWrite>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, members: Vec<NodeId>) -> Self {
        Self::with_config(id, members, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, members: Vec<NodeId>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster: ClusterView::new(id, members),
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: BTreeSet::new(),
            replication: None,
            writes: Vec::new(),
        }
    }

    /// Rebuild a node from what the durable store holds. Commit and applied
    /// indexes are volatile and restart at zero.
    pub fn restore(
        id: NodeId,
        members: Vec<NodeId>,
        config: RaftConfig,
        term: Term,
        voted_for: Option<NodeId>,
        entries: Vec<LogEntry>,
    ) -> Result<Self, RaftError> {
        let log = Log::from_entries(entries)?;
        if log.last_term() > term {
            return Err(RaftError::CorruptLog(format!(
                "last entry term {} is ahead of persisted term {term}",
                log.last_term()
            )));
        }
        let mut node = Self::with_config(id, members, config);
        node.current_term = term;
        node.voted_for = voted_for;
        node.log = log;
        Ok(node)
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster.quorum_size()
    }

    /// Whether the votes gathered so far form a majority
    pub fn has_quorum(&self) -> bool {
        self.cluster.is_quorum(&self.votes_received)
    }

    pub fn last_log_index(&self) -> Index {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: Index) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at index, 0 when there is no such entry
    pub fn get_term_at(&self, index: Index) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    /// Durable writes queued since the last call, oldest first.
    pub fn take_writes(&mut self) -> Vec<DurableWrite> {
        std::mem::take(&mut self.writes)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
        }
    }

    /// Accept a client command. Only the leader appends; everyone else
    /// answers with the leader they know of.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogEntry, RaftError> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader(self.leader_id));
        }
        if command.is_empty() {
            return Err(RaftError::EmptyCommand);
        }
        let entry = self.append_local(command);
        tracing::debug!(node_id = self.id, index = entry.index, term = entry.term, "Appended command to log");
        // a single-node cluster commits on its own append
        self.maybe_advance_commit();
        Ok(entry)
    }

    /// Committed entries not yet handed to the state machine, in index order.
    /// Marks them applied.
    pub fn entries_to_apply(&mut self) -> Vec<LogEntry> {
        debug_assert!(self.last_applied <= self.commit_index);
        let entries = self
            .log
            .entries_from(self.last_applied + 1, (self.commit_index - self.last_applied) as usize);
        if let Some(last) = entries.last() {
            self.last_applied = last.index;
        }
        entries
    }

    /// Pick up after a state machine that already holds every entry through
    /// `applied`. Entries are only applied once committed, so the commit
    /// index starts there as well. Clamped to the local log; returns the
    /// index actually resumed from.
    pub fn resume_applied(&mut self, applied: Index) -> Index {
        let applied = applied.min(self.log.last_index());
        self.commit_index = self.commit_index.max(applied);
        self.last_applied = self.last_applied.max(applied);
        applied
    }

    /// Adopt `term` if it is newer than ours, stepping down to follower.
    /// Returns whether the term changed.
    pub(crate) fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    /// Become follower in `term`. A newer term clears the vote; staying in the
    /// same term (a candidate meeting the elected leader) keeps it.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        assert!(
            term >= self.current_term,
            "term regression {} -> {term}",
            self.current_term
        );
        if term > self.current_term {
            tracing::info!(node_id = self.id, old_term = self.current_term, term, "Discovered new term");
            self.set_term_and_vote(term, None);
        }
        if self.state != NodeState::Follower {
            tracing::info!(node_id = self.id, term, from = %self.state, "Stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.leader_id = leader_id;
        self.votes_received.clear();
        self.replication = None;
    }

    pub(crate) fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) {
        self.current_term = term;
        self.voted_for = voted_for;
        // only the latest term/vote pair matters, drop a superseded one
        if let Some(DurableWrite::TermAndVote { .. }) = self.writes.last() {
            self.writes.pop();
        }
        self.writes.push(DurableWrite::TermAndVote { term, voted_for });
    }

    pub(crate) fn append_local(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = self.log.append(self.current_term, command).clone();
        self.writes.push(DurableWrite::Append(vec![entry.clone()]));
        entry
    }

    pub(crate) fn push_write(&mut self, write: DurableWrite) {
        self.writes.push(write);
    }
}
