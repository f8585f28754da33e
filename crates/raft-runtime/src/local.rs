//! # local
//!
//! why: run whole clusters inside one process, with a network we can break on purpose
//! relations: implements transport::Transport on top of node::RaftHandle
//! what: LocalNetwork (registry, partitions, loss, delay), LocalTransport

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raft_core::{NodeId, RaftMessage};
use tokio::sync::Mutex;

use crate::node::RaftHandle;
use crate::transport::{Transport, TransportError};

struct NetworkState {
    nodes: HashMap<NodeId, RaftHandle>,
    /// Directed links that currently lose every message
    blocked: HashSet<(NodeId, NodeId)>,
    drop_rate: f64,
    delay: Duration,
    rng: StdRng,
}

/// In-process network shared by every node of a test or demo cluster.
#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::seeded(0)
    }

    /// Seed for the random message loss.
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                nodes: HashMap::new(),
                blocked: HashSet::new(),
                drop_rate: 0.0,
                delay: Duration::ZERO,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Transport for node `id` to reach its peers over this network.
    pub fn transport(&self, id: NodeId) -> LocalTransport {
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    pub async fn register(&self, handle: RaftHandle) {
        self.state.lock().await.nodes.insert(handle.id(), handle);
    }

    /// Forget a node; calls to it fail as unreachable until it registers again.
    pub async fn unregister(&self, id: NodeId) -> Option<RaftHandle> {
        self.state.lock().await.nodes.remove(&id)
    }

    pub async fn handle(&self, id: NodeId) -> Option<RaftHandle> {
        self.state.lock().await.nodes.get(&id).cloned()
    }

    /// Cut both directions between every node of `group_a` and every node of `group_b`.
    pub async fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut state = self.state.lock().await;
        for &a in group_a {
            for &b in group_b {
                state.blocked.insert((a, b));
                state.blocked.insert((b, a));
            }
        }
        tracing::info!(?group_a, ?group_b, "Network partitioned");
    }

    /// Cut a node off from everyone else.
    pub async fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = {
            let state = self.state.lock().await;
            state.nodes.keys().copied().filter(|&n| n != id).collect()
        };
        self.partition(&[id], &others).await;
    }

    /// Cut one direction only: messages from `from` to `to` are lost.
    pub async fn block(&self, from: NodeId, to: NodeId) {
        self.state.lock().await.blocked.insert((from, to));
    }

    /// Restore every link.
    pub async fn heal(&self) {
        self.state.lock().await.blocked.clear();
        tracing::info!("Network healed");
    }

    /// Restore the links of a single node.
    pub async fn heal_node(&self, id: NodeId) {
        self.state
            .lock()
            .await
            .blocked
            .retain(|&(from, to)| from != id && to != id);
    }

    /// Probability in `[0, 1]` that any single message is lost.
    pub async fn set_drop_rate(&self, drop_rate: f64) {
        self.state.lock().await.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// Fixed one-way latency added to every message.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = delay;
    }

    /// Whether a message from `from` to `to` gets through this time, and how
    /// long it takes.
    async fn route(&self, from: NodeId, to: NodeId) -> Result<Duration, TransportError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.blocked.contains(&(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        if state.drop_rate > 0.0 && state.rng.gen_bool(state.drop_rate) {
            return Err(TransportError::Dropped(to));
        }
        Ok(state.delay)
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        request: RaftMessage,
    ) -> Result<RaftMessage, TransportError> {
        let delay = self.route(from, to).await?;
        let target = self
            .handle(to)
            .await
            .ok_or(TransportError::Unreachable(to))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = target
            .handle_rpc(request)
            .await
            .map_err(|_| TransportError::Stopped(to))?;

        // the response crosses the network too
        let delay = self.route(to, from).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(
        &self,
        to: NodeId,
        request: RaftMessage,
        timeout: Duration,
    ) -> Result<RaftMessage, TransportError> {
        match tokio::time::timeout(timeout, self.network.deliver(self.id, to, request)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::trace!(from = self.id, to, error = %e, "Local delivery failed");
                }
                result
            }
            Err(_) => Err(TransportError::Timeout(to)),
        }
    }
}
