//! # error
//!
//! why: name the few ways a protocol call can be refused
//! relations: returned by node.rs and config.rs, wrapped by raft-runtime
//! what: RaftError enum

use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("empty commands are reserved for leader no-op entries")]
    EmptyCommand,

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
