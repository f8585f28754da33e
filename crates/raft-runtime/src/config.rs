//! # config
//!
//! why: describe one node of a cluster: who it is, who its peers are, where it keeps state
//! relations: consumed by node::ConsensusNode and the raft-cluster binary, embeds raft_core::RaftConfig
//! what: NodeConfig with builders, JSON loading and validation

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use raft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Everything one node needs to start.
///
/// `members` is the full, fixed voter set and includes the node itself.
/// Without a `data_dir` the node keeps its state in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub members: Vec<NodeId>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            members: vec![id],
            data_dir: None,
            raft: RaftConfig::default(),
        }
    }

    pub fn with_peer(mut self, id: NodeId) -> Self {
        if !self.members.contains(&id) {
            self.members.push(id);
        }
        self
    }

    pub fn with_members(mut self, members: impl IntoIterator<Item = NodeId>) -> Self {
        for id in members {
            self = self.with_peer(id);
        }
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.members.contains(&self.id) {
            return Err(Error::Config(format!(
                "node {} is not listed in members {:?}",
                self.id, self.members
            )));
        }
        let unique: BTreeSet<&NodeId> = self.members.iter().collect();
        if unique.len() != self.members.len() {
            return Err(Error::Config(format!(
                "duplicate node ids in members {:?}",
                self.members
            )));
        }
        self.raft.validate()?;
        Ok(())
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |&id| id != self.id)
    }
}
