//! # error
//!
//! why: one error type for everything a caller of a running node can hit
//! relations: wraps raft_core::RaftError and raft_storage::StorageError
//! what: Error, Result

use raft_core::{NodeId, RaftError};
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Empty commands are reserved for leader no-op entries")]
    EmptyCommand,

    #[error("Node has stopped")]
    Stopped,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt persisted log: {0}")]
    CorruptLog(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read config file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl From<RaftError> for Error {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader(leader) => Error::NotLeader(leader),
            RaftError::EmptyCommand => Error::EmptyCommand,
            RaftError::CorruptLog(msg) => Error::CorruptLog(msg),
            RaftError::InvalidConfig(msg) => Error::Config(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
