//! # transport
//!
//! why: the node actor must not care how messages reach its peers
//! relations: called by node::ConsensusNode, implemented by local::LocalTransport
//! what: Transport trait, TransportError

use std::time::Duration;

use async_trait::async_trait;
use raft_core::{NodeId, RaftMessage};
use thiserror::Error;

/// Why an outgoing call produced no response. None of these are fatal; the
/// replication and election loops simply retry on their next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("message to node {0} was lost")]
    Dropped(NodeId),

    #[error("node {0} has stopped")]
    Stopped(NodeId),

    #[error("call to node {0} timed out")]
    Timeout(NodeId),
}

/// Request/response delivery between nodes.
///
/// A transport may lose, delay or duplicate calls but must never alter a
/// payload. It does not need to suppress duplicates: every request the
/// protocol sends is safe to repeat.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` (a `VoteRequest` or `AppendEntries`) to `to` and wait
    /// at most `timeout` for the matching response.
    async fn call(
        &self,
        to: NodeId,
        request: RaftMessage,
        timeout: Duration,
    ) -> Result<RaftMessage, TransportError>;
}
