//! # config
//!
//! why: collect the timing and batching knobs of a raft node in one place
//! relations: read by node.rs (batch size, check quorum) and by raft-runtime (timers)
//! what: RaftConfig with defaults and validation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Timing and batching settings, all durations in milliseconds.
///
/// The election timeout is drawn uniformly from
/// `[election_timeout_min, election_timeout_max]`; the defaults give the
/// classic `[T, 2T]` window with `T = 150ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// Upper bound on a single outgoing RPC. Must stay below the election
    /// timeout so a hung call cannot keep a node from campaigning.
    pub rpc_timeout: u64,
    /// How long `submit` waits for its entry to commit.
    pub submit_timeout: u64,
    /// Maximum entries carried by one AppendEntries call.
    pub max_append_entries: usize,
    /// Step down when a quorum has not answered within an election timeout.
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            submit_timeout: 2000,
            max_append_entries: 100,
            check_quorum: true,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}ms) must be below election_timeout_min ({}ms)",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.election_timeout_max < self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_max ({}ms) is below election_timeout_min ({}ms)",
                self.election_timeout_max, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 || self.rpc_timeout >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "rpc_timeout ({}ms) must be positive and below election_timeout_min ({}ms)",
                self.rpc_timeout, self.election_timeout_min
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::InvalidConfig(
                "max_append_entries must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout)
    }

    /// The window a leader waits for a quorum of replies before stepping down.
    pub fn quorum_check_interval(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max)
    }
}
