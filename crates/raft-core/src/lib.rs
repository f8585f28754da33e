//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime, persisted via raft-storage
//! what: state machine, election logic, replication and commit rules, log management, message types
//!
//! Nothing in this crate performs I/O or reads a clock. Handlers mutate the
//! node and queue [`DurableWrite`]s; the embedding runtime persists those
//! before letting any response leave the node.

pub mod cluster;
pub mod config;
mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod replication;
pub mod timer;

/// Identifies a voting member of the cluster
pub type NodeId = u64;
/// Monotonic election epoch
pub type Term = u64;
/// 1-based log position; 0 means "before the first entry"
pub type Index = u64;

pub use cluster::ClusterView;
pub use config::RaftConfig;
pub use error::RaftError;
pub use log::{Log, LogEntry};
pub use message::{
    AppendEntries, AppendEntriesResponse, ConflictHint, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{DurableWrite, NodeState, RaftNode, Status};
pub use replication::{Progress, Replication};
pub use timer::{ElectionTimer, RandomTimeouts, TimeoutSource};
