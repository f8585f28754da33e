//! # election
//!
//! why: leader election - candidacy, vote granting, vote counting
//! relations: extends RaftNode from node.rs, hands off to replication.rs on victory
//! what: start_election, handle_vote_request, handle_vote_response, become_leader

use crate::message::{VoteRequest, VoteResponse};
use crate::node::{NodeState, RaftNode};
use crate::replication::Replication;
use crate::NodeId;

impl RaftNode {
    /// Election timeout fired: enter (or re-enter) candidacy in a new term,
    /// vote for ourselves and produce the request to send to every peer.
    ///
    /// A single-node cluster wins on its own vote and returns as leader.
    pub fn start_election(&mut self) -> VoteRequest {
        let term = self.current_term + 1;
        self.set_term_and_vote(term, Some(self.id));
        self.state = NodeState::Candidate;
        self.leader_id = None;
        self.replication = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);

        tracing::info!(node_id = self.id, term, "Starting election");

        let request = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Handle an incoming RequestVote. Returns the response and whether the
    /// election timer should be reset (only when the vote was granted).
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, bool) {
        self.observe_term(req.term);

        let vote_granted = if req.term < self.current_term {
            false
        } else if self.voted_for.is_some_and(|v| v != req.candidate_id) {
            false
        } else if !self.log.is_up_to_date(req.last_log_index, req.last_log_term) {
            false
        } else {
            if self.voted_for != Some(req.candidate_id) {
                self.set_term_and_vote(self.current_term, Some(req.candidate_id));
            }
            true
        };

        tracing::debug!(
            node_id = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted = vote_granted,
            "RequestVote response"
        );

        (
            VoteResponse {
                term: self.current_term,
                vote_granted,
            },
            vote_granted,
        )
    }

    /// Count a vote reply. Returns true if this reply made us leader.
    pub fn handle_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> bool {
        if self.observe_term(resp.term) {
            return false;
        }
        // stale replies from an earlier candidacy carry an older term
        if self.state != NodeState::Candidate || resp.term < self.current_term {
            return false;
        }
        if !resp.vote_granted || !self.cluster.contains(from) {
            return false;
        }

        self.votes_received.insert(from);
        tracing::debug!(
            node_id = self.id,
            peer_id = from,
            votes = self.votes_received.len(),
            "Received vote"
        );

        if self.has_quorum() {
            self.become_leader();
            true
        } else {
            false
        }
    }

    /// Take office: fresh replication cursors for every peer and a no-op
    /// entry in our term so earlier-term entries can commit.
    fn become_leader(&mut self) {
        debug_assert_eq!(self.state, NodeState::Candidate);
        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            votes = self.votes_received.len(),
            "Became leader"
        );

        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.replication = Some(Replication::new(
            self.cluster.peers(),
            self.last_log_index(),
        ));

        self.append_local(Vec::new());
        self.maybe_advance_commit();
    }
}
