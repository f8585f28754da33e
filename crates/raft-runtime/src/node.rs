//! # node
//!
//! why: give each raft-core node its own task, clock, storage and network
//! relations: wraps raft_core::RaftNode, persists via raft_storage::Storage, talks over Transport
//! what: ConsensusNode actor, RaftHandle client api, SubmitOutcome
//!
//! The actor is the single point of serialization for its node: RPCs,
//! client submissions, timer expiries and RPC replies all arrive as events on
//! one channel and are handled one at a time. Every handler drains the core's
//! durable write queue into storage before anything it produced (a reply, an
//! outgoing call, an applied entry, a resolved submission) leaves the actor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    DurableWrite, ElectionTimer, Index, NodeId, NodeState, RaftMessage, RaftNode, Status, Term,
};
use raft_storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::state_machine::StateMachine;
use crate::transport::{Transport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result of a client submission. `committed` is false when the entry did
/// not commit in its own term before the submit timeout, including when it
/// was overwritten by a later leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub committed: bool,
    pub index: Index,
}

type Accepted = Result<(Index, oneshot::Receiver<bool>)>;

enum Event {
    /// Incoming VoteRequest or AppendEntries from a peer
    Rpc {
        request: RaftMessage,
        reply: oneshot::Sender<RaftMessage>,
    },
    /// Response to one of our own calls
    Reply {
        peer: NodeId,
        request_id: u64,
        response: RaftMessage,
    },
    RpcFailed {
        peer: NodeId,
        request_id: u64,
        error: TransportError,
    },
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Accepted>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Shutdown,
}

/// A submission waiting for its index to be applied.
struct Waiter {
    term: Term,
    tx: oneshot::Sender<bool>,
}

/// One Raft node driven by tokio.
pub struct ConsensusNode<S, T, M> {
    raft: RaftNode,
    storage: S,
    transport: Arc<T>,
    state_machine: M,
    timer: ElectionTimer,

    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,

    waiters: BTreeMap<Index, Waiter>,
    /// Peers with an AppendEntries outstanding, by request id
    in_flight: HashMap<NodeId, u64>,
    next_request_id: u64,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
    quorum_deadline: Instant,
}

impl<S, T, M> ConsensusNode<S, T, M>
where
    S: Storage + Send + 'static,
    T: Transport,
    M: StateMachine,
{
    /// Build a node from its config and whatever `storage` already holds.
    pub fn new(config: &NodeConfig, storage: S, transport: T, state_machine: M) -> Result<Self> {
        config.validate()?;

        let (term, voted_for) = storage.load_term_and_vote()?;
        let entries = storage.load_log()?;
        let mut raft = RaftNode::restore(
            config.id,
            config.members.clone(),
            config.raft.clone(),
            term,
            voted_for,
            entries,
        )?;
        let stored_applied = state_machine.applied_index();
        let applied = raft.resume_applied(stored_applied);
        if applied < stored_applied {
            tracing::warn!(
                node_id = config.id,
                applied = stored_applied,
                last_log_index = raft.last_log_index(),
                "State machine is ahead of the log"
            );
        }
        tracing::info!(
            node_id = config.id,
            term,
            last_log_index = raft.last_log_index(),
            last_applied = applied,
            "Restored node state"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let now = Instant::now();
        Ok(Self {
            timer: ElectionTimer::new(&config.raft),
            raft,
            storage,
            transport: Arc::new(transport),
            state_machine,
            events_tx,
            events_rx,
            waiters: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_request_id: 0,
            election_deadline: now,
            heartbeat_deadline: now,
            quorum_deadline: now,
        })
    }

    /// Replace the election timer, e.g. with a seeded or scripted one.
    pub fn with_election_timer(mut self, timer: ElectionTimer) -> Self {
        self.timer = timer;
        self
    }

    pub fn id(&self) -> NodeId {
        self.raft.id
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            id: self.raft.id,
            events: self.events_tx.clone(),
            submit_timeout: self.raft.config.submit_timeout(),
        }
    }

    /// Run the node on its own task.
    pub fn spawn(self) -> RaftHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// The event loop. Returns on shutdown or on a storage failure.
    pub async fn run(mut self) {
        tracing::info!(node_id = self.raft.id, members = ?self.raft.cluster.members().collect::<Vec<_>>(), "Raft node started");
        self.reset_election_deadline();

        loop {
            let leader = self.raft.is_leader();
            let check_quorum = leader && self.raft.config.check_quorum;

            let step = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },

                // Election timeout (for followers and candidates)
                _ = sleep_until(self.election_deadline), if !leader => self.on_election_timeout(),

                // Heartbeat interval (for leaders)
                _ = sleep_until(self.heartbeat_deadline), if leader => self.on_heartbeat(),

                _ = sleep_until(self.quorum_deadline), if check_quorum => self.on_quorum_check(),
            };

            if let Err(e) = step {
                tracing::error!(node_id = self.raft.id, error = %e, "Storage failure, stopping node");
                break;
            }
        }

        tracing::info!(node_id = self.raft.id, term = self.raft.current_term, "Raft node stopped");
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Rpc { request, reply } => self.on_rpc(request, reply),
            Event::Reply {
                peer,
                request_id,
                response,
            } => self.on_reply(peer, request_id, response),
            Event::RpcFailed {
                peer,
                request_id,
                error,
            } => {
                tracing::trace!(node_id = self.raft.id, peer_id = peer, error = %error, "RPC failed");
                self.clear_in_flight(peer, request_id);
                Ok(())
            }
            Event::Submit { command, reply } => self.on_submit(command, reply),
            Event::Status { reply } => {
                let _ = reply.send(self.raft.status());
                Ok(())
            }
            Event::Shutdown => Ok(()),
        }
    }

    fn on_rpc(&mut self, request: RaftMessage, reply: oneshot::Sender<RaftMessage>) -> Result<()> {
        let prev = self.raft.state;
        let (response, reset_timer) = match request {
            RaftMessage::VoteRequest(req) => {
                let (resp, reset) = self.raft.handle_vote_request(&req);
                (RaftMessage::from(resp), reset)
            }
            RaftMessage::AppendEntries(req) => {
                let (resp, reset) = self.raft.handle_append_entries(&req);
                (RaftMessage::from(resp), reset)
            }
            other => {
                tracing::debug!(node_id = self.raft.id, term = other.term(), "Ignoring response delivered as a request");
                return Ok(());
            }
        };

        // the vote or the appended entries must be durable before the reply
        self.persist()?;
        if reset_timer {
            self.reset_election_deadline();
        }
        self.after_transition(prev);
        let _ = reply.send(response);
        self.apply_committed();
        Ok(())
    }

    fn on_reply(&mut self, peer: NodeId, request_id: u64, response: RaftMessage) -> Result<()> {
        let prev = self.raft.state;
        match response {
            RaftMessage::VoteResponse(resp) => {
                self.raft.handle_vote_response(peer, &resp);
                self.persist()?;
                self.after_transition(prev);
            }
            RaftMessage::AppendEntriesResponse(resp) => {
                self.clear_in_flight(peer, request_id);
                self.raft.handle_append_entries_response(peer, &resp);
                self.persist()?;
                self.after_transition(prev);
                // rejected, or accepted but still behind: push again right away
                if self.raft.is_leader() && (!resp.success || self.raft.is_lagging(peer)) {
                    self.send_append_entries(peer);
                }
                self.apply_committed();
            }
            other => {
                tracing::debug!(node_id = self.raft.id, peer_id = peer, term = other.term(), "Ignoring request delivered as a response");
            }
        }
        Ok(())
    }

    fn on_submit(&mut self, command: Vec<u8>, reply: oneshot::Sender<Accepted>) -> Result<()> {
        let entry = match self.raft.propose(command) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(());
            }
        };
        self.persist()?;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            entry.index,
            Waiter {
                term: entry.term,
                tx,
            },
        );
        let _ = reply.send(Ok((entry.index, rx)));

        for peer in self.raft.cluster.peers().collect::<Vec<_>>() {
            if !self.in_flight.contains_key(&peer) {
                self.send_append_entries(peer);
            }
        }
        // a single-node cluster has already committed it
        self.apply_committed();
        Ok(())
    }

    fn on_election_timeout(&mut self) -> Result<()> {
        let prev = self.raft.state;
        let request = self.raft.start_election();
        self.persist()?;
        self.reset_election_deadline();

        for peer in self.raft.cluster.peers().collect::<Vec<_>>() {
            self.send(peer, request.clone().into());
        }
        self.after_transition(prev);
        self.apply_committed();
        Ok(())
    }

    fn on_heartbeat(&mut self) -> Result<()> {
        self.heartbeat_deadline = Instant::now() + self.raft.config.heartbeat_interval();
        self.drop_abandoned_waiters();
        self.broadcast_append_entries();
        Ok(())
    }

    fn on_quorum_check(&mut self) -> Result<()> {
        self.quorum_deadline = Instant::now() + self.raft.config.quorum_check_interval();
        let prev = self.raft.state;
        self.raft.check_quorum();
        self.persist()?;
        self.after_transition(prev);
        Ok(())
    }

    /// Bookkeeping for role changes caused by the last handler.
    fn after_transition(&mut self, prev: NodeState) {
        let now = self.raft.state;
        if prev == now {
            return;
        }
        if now == NodeState::Leader {
            self.in_flight.clear();
            // announce leadership with an immediate round
            self.heartbeat_deadline = Instant::now() + self.raft.config.heartbeat_interval();
            self.quorum_deadline = Instant::now() + self.raft.config.quorum_check_interval();
            self.broadcast_append_entries();
        } else if prev == NodeState::Leader {
            self.in_flight.clear();
            self.reset_election_deadline();
        }
    }

    /// Drain the core's write queue into storage. Submissions whose entries
    /// are being truncated away can never commit and are answered now.
    fn persist(&mut self) -> Result<()> {
        let writes = self.raft.take_writes();
        if writes.is_empty() {
            return Ok(());
        }
        for write in &writes {
            if let DurableWrite::TruncateFrom(index) = write {
                for (_, waiter) in self.waiters.split_off(index) {
                    let _ = waiter.tx.send(false);
                }
            }
        }
        self.storage.apply(writes)?;
        Ok(())
    }

    /// Hand newly committed entries to the state machine, then answer the
    /// submissions they cover.
    fn apply_committed(&mut self) {
        for entry in self.raft.entries_to_apply() {
            tracing::trace!(node_id = self.raft.id, index = entry.index, "Applying entry");
            self.state_machine.apply(&entry);
        }

        let applied = self.raft.last_applied;
        while let Some(waiter) = self.waiters.first_entry() {
            let index = *waiter.key();
            if index > applied {
                break;
            }
            let waiter = waiter.remove();
            let committed = self.raft.log.term_at(index) == Some(waiter.term);
            let _ = waiter.tx.send(committed);
        }
    }

    /// Forget submissions whose caller has already given up.
    fn drop_abandoned_waiters(&mut self) {
        let before = self.waiters.len();
        self.waiters.retain(|_, waiter| !waiter.tx.is_closed());
        let dropped = before - self.waiters.len();
        if dropped > 0 {
            tracing::debug!(node_id = self.raft.id, dropped, "Dropped abandoned submissions");
        }
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.timer.next();
    }

    fn broadcast_append_entries(&mut self) {
        for peer in self.raft.cluster.peers().collect::<Vec<_>>() {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&mut self, peer: NodeId) {
        if let Some(request) = self.raft.append_entries_for(peer) {
            let request_id = self.send(peer, request.into());
            self.in_flight.insert(peer, request_id);
        }
    }

    fn clear_in_flight(&mut self, peer: NodeId, request_id: u64) {
        if self.in_flight.get(&peer) == Some(&request_id) {
            self.in_flight.remove(&peer);
        }
    }

    /// Issue a call on its own task; the outcome comes back as an event.
    fn send(&mut self, peer: NodeId, request: RaftMessage) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let timeout = self.raft.config.rpc_timeout();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, transport.call(peer, request, timeout)).await {
                Ok(Ok(response)) => Event::Reply {
                    peer,
                    request_id,
                    response,
                },
                Ok(Err(error)) => Event::RpcFailed {
                    peer,
                    request_id,
                    error,
                },
                Err(_) => Event::RpcFailed {
                    peer,
                    request_id,
                    error: TransportError::Timeout(peer),
                },
            };
            // the node may have stopped meanwhile
            let _ = events.send(event).await;
        });
        request_id
    }
}

/// Cloneable client handle to a running node.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    submit_timeout: Duration,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose a command and wait until it is applied on this node or the
    /// submit timeout passes. Only the leader accepts submissions; others
    /// answer [`Error::NotLeader`] with the leader they know of.
    pub async fn submit(&self, command: impl Into<Vec<u8>>) -> Result<SubmitOutcome> {
        let deadline = Instant::now() + self.submit_timeout;
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Submit {
                command: command.into(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Stopped)?;
        let (index, committed) = rx.await.map_err(|_| Error::Stopped)??;

        match tokio::time::timeout_at(deadline, committed).await {
            Ok(Ok(committed)) => Ok(SubmitOutcome { committed, index }),
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => {
                tracing::debug!(node_id = self.id, index, "Submit timed out before commit");
                Ok(SubmitOutcome {
                    committed: false,
                    index,
                })
            }
        }
    }

    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Status { reply: tx })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Deliver an incoming VoteRequest or AppendEntries and wait for the
    /// node's response. Transports call this on the receiving side.
    pub async fn handle_rpc(&self, request: RaftMessage) -> Result<RaftMessage> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Rpc { request, reply: tx })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Stop the node after the events already queued.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNetwork;
    use crate::state_machine::KvStore;
    use raft_core::{LogEntry, VoteResponse};
    use raft_storage::InMemoryStorage;

    fn single_node(store: KvStore) -> RaftHandle {
        let config = NodeConfig::new(1);
        ConsensusNode::new(&config, InMemoryStorage::new(), LocalNetwork::new().transport(1), store)
            .unwrap()
            .with_election_timer(ElectionTimer::seeded(&config.raft, 3))
            .spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_elects_itself_and_commits() {
        let store = KvStore::new();
        let handle = single_node(store.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, NodeState::Leader);
        assert_eq!(status.term, 1);
        assert_eq!(status.leader_id, Some(1));

        let outcome = handle.submit(b"SET a 1".to_vec()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome { committed: true, index: 2 });
        assert_eq!(store.get("a").as_deref(), Some("1"));

        let status = handle.status().await.unwrap();
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.last_applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_without_leader_refuses_submit() {
        let config = NodeConfig::new(1).with_members([1, 2, 3]);
        let handle = ConsensusNode::new(
            &config,
            InMemoryStorage::new(),
            LocalNetwork::new().transport(1),
            KvStore::new(),
        )
        .unwrap()
        .spawn();

        let err = handle.submit(b"SET a 1".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_handle() {
        let handle = single_node(KvStore::new());
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(handle.is_stopped());
        assert!(matches!(handle.status().await, Err(Error::Stopped)));
        assert!(matches!(handle.submit(b"x".to_vec()).await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let config = NodeConfig {
            id: 9,
            members: vec![1, 2],
            data_dir: None,
            raft: Default::default(),
        };
        let result = ConsensusNode::new(
            &config,
            InMemoryStorage::new(),
            LocalNetwork::new().transport(9),
            KvStore::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn start_resumes_after_state_machine_applied_index() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(2, Some(1)).unwrap();
        storage
            .append_entries(&[
                LogEntry::noop(1, 1),
                LogEntry::new(1, 2, b"SET a 1".to_vec()),
                LogEntry::new(2, 3, b"SET a 2".to_vec()),
            ])
            .unwrap();

        let mut store = KvStore::new();
        store.apply(&LogEntry::noop(1, 1));
        store.apply(&LogEntry::new(1, 2, b"SET a 1".to_vec()));

        let config = NodeConfig::new(1).with_members([1, 2, 3]);
        let node = ConsensusNode::new(&config, storage, LocalNetwork::new().transport(1), store).unwrap();
        assert_eq!(node.raft.last_applied, 2);
        assert_eq!(node.raft.commit_index, 2);
    }

    #[tokio::test]
    async fn abandoned_submissions_are_dropped_on_heartbeat() {
        let config = NodeConfig::new(1).with_members([1, 2, 3]);
        let mut node = ConsensusNode::new(
            &config,
            InMemoryStorage::new(),
            LocalNetwork::new().transport(1),
            KvStore::new(),
        )
        .unwrap();
        node.raft.start_election();
        node.raft.handle_vote_response(2, &VoteResponse { term: 1, vote_granted: true });
        node.persist().unwrap();
        assert!(node.raft.is_leader());

        // the peers never answer, so nothing commits
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            node.on_submit(b"SET a 1".to_vec(), tx).unwrap();
            let (_, committed) = rx.await.unwrap().unwrap();
            drop(committed);
        }
        let (tx, rx) = oneshot::channel();
        node.on_submit(b"SET b 2".to_vec(), tx).unwrap();
        let (index, _pending) = rx.await.unwrap().unwrap();
        assert_eq!(node.waiters.len(), 4);

        node.on_heartbeat().unwrap();
        assert_eq!(node.waiters.keys().copied().collect::<Vec<_>>(), vec![index]);
    }
}
