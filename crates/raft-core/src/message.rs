//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs handlers, carried by raft-runtime transports
//! what: VoteRequest, VoteResponse, AppendEntries, AppendEntriesResponse, RaftMessage

use serde::{Deserialize, Serialize};

use crate::{Index, LogEntry, NodeId, Term};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

impl AppendEntries {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success: `prev_log_index + entries.len()` of the acknowledged call.
    /// On failure: the follower's last log index.
    pub match_index: Index,
    /// On a log-matching rejection, where the leader should resume probing.
    pub conflict: Option<ConflictHint>,
}

/// Lets the leader skip a whole conflicting term instead of probing one index
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    /// Term of the follower's entry at `prev_log_index`, if it has one.
    pub term: Option<Term>,
    /// First index of that term in the follower's log, or the follower's
    /// last index + 1 when its log is too short.
    pub index: Index,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// The sender's term, carried by every message.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            RaftMessage::VoteRequest(_) | RaftMessage::AppendEntries(_)
        )
    }
}

impl From<VoteRequest> for RaftMessage {
    fn from(m: VoteRequest) -> Self {
        RaftMessage::VoteRequest(m)
    }
}

impl From<VoteResponse> for RaftMessage {
    fn from(m: VoteResponse) -> Self {
        RaftMessage::VoteResponse(m)
    }
}

impl From<AppendEntries> for RaftMessage {
    fn from(m: AppendEntries) -> Self {
        RaftMessage::AppendEntries(m)
    }
}

impl From<AppendEntriesResponse> for RaftMessage {
    fn from(m: AppendEntriesResponse) -> Self {
        RaftMessage::AppendEntriesResponse(m)
    }
}
