//! # replication
//!
//! why: push the leader's log to followers and decide when entries commit
//! relations: extends RaftNode from node.rs; cursors created by election.rs on victory
//! what: Progress cursors, AppendEntries building and handling, commit advancement, check quorum

use std::collections::BTreeMap;

use crate::message::{AppendEntries, AppendEntriesResponse, ConflictHint};
use crate::node::{DurableWrite, NodeState, RaftNode};
use crate::{Index, NodeId};

/// Per-follower replication cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// The next index to send
    pub next_index: Index,
    /// The highest index known to match the follower's log
    pub match_index: Index,
    /// Whether the follower answered since the last quorum check
    pub recent_active: bool,
}

/// Leader-private cursors for every peer. Built fresh on each election and
/// dropped on step-down, never handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replication {
    pub progress: BTreeMap<NodeId, Progress>,
}

impl Replication {
    pub fn new(peers: impl IntoIterator<Item = NodeId>, last_log_index: Index) -> Self {
        let progress = peers
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                        recent_active: false,
                    },
                )
            })
            .collect();
        Self { progress }
    }

    pub fn next_index(&self, peer: NodeId) -> Option<Index> {
        self.progress.get(&peer).map(|p| p.next_index)
    }

    pub fn match_index(&self, peer: NodeId) -> Option<Index> {
        self.progress.get(&peer).map(|p| p.match_index)
    }
}

impl RaftNode {
    /// Build the next AppendEntries for `peer`: everything from its
    /// `next_index`, capped at the batch size. Empty when the peer is caught
    /// up, which makes it a heartbeat. `None` unless we lead.
    pub fn append_entries_for(&self, peer: NodeId) -> Option<AppendEntries> {
        if self.state != NodeState::Leader {
            return None;
        }
        let progress = self.replication.as_ref()?.progress.get(&peer)?;
        let prev_log_index = progress.next_index - 1;
        Some(AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self
                .log
                .entries_from(progress.next_index, self.config.max_append_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Whether `peer` still lacks entries we hold.
    pub fn is_lagging(&self, peer: NodeId) -> bool {
        self.replication
            .as_ref()
            .and_then(|r| r.next_index(peer))
            .is_some_and(|next| next <= self.last_log_index())
    }

    /// Handle an incoming AppendEntries. Returns the response and whether
    /// the election timer should be reset (any call from a current leader).
    pub fn handle_append_entries(&mut self, req: &AppendEntries) -> (AppendEntriesResponse, bool) {
        if req.term < self.current_term {
            return (self.reject(None), false);
        }

        if req.term > self.current_term || self.state != NodeState::Follower {
            assert_ne!(
                (self.state, req.term),
                (NodeState::Leader, self.current_term),
                "two leaders in one term"
            );
            self.become_follower(req.term, Some(req.leader_id));
        } else {
            self.leader_id = Some(req.leader_id);
        }

        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let hint = match self.log.term_at(req.prev_log_index) {
                Some(term) => ConflictHint {
                    term: Some(term),
                    index: self.log.first_index_of_term(term, req.prev_log_index),
                },
                None => ConflictHint {
                    term: None,
                    index: self.last_log_index() + 1,
                },
            };
            tracing::debug!(
                node_id = self.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "Log mismatch, rejecting AppendEntries"
            );
            return (self.reject(Some(hint)), true);
        }

        let consecutive = req
            .entries
            .iter()
            .zip(req.prev_log_index + 1..)
            .all(|(e, expected)| e.index == expected);
        if !consecutive {
            tracing::warn!(node_id = self.id, leader = req.leader_id, "Malformed AppendEntries batch");
            return (self.reject(None), true);
        }

        // Skip entries we already hold; replace the suffix from the first
        // conflicting one. A retried or reordered call is thus a no-op.
        let mut new_entries = Vec::new();
        for entry in &req.entries {
            if new_entries.is_empty() {
                match self.log.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        assert!(
                            entry.index > self.commit_index,
                            "refusing to truncate committed entry {}",
                            entry.index
                        );
                        tracing::info!(node_id = self.id, from_index = entry.index, "Truncating conflicting log suffix");
                        self.log.truncate_from(entry.index);
                        self.push_write(DurableWrite::TruncateFrom(entry.index));
                    }
                    None => {}
                }
            }
            new_entries.push(entry.clone());
        }
        if !new_entries.is_empty() {
            for entry in &new_entries {
                self.log.push(entry.clone());
            }
            tracing::debug!(
                node_id = self.id,
                entries_appended = new_entries.len(),
                new_last_index = self.last_log_index(),
                "Appended entries"
            );
            self.push_write(DurableWrite::Append(new_entries));
        }

        let last_new_index = req.prev_log_index + req.entries.len() as Index;
        let commit = req.leader_commit.min(last_new_index);
        if commit > self.commit_index {
            self.commit_index = commit;
        }

        (
            AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: last_new_index,
                conflict: None,
            },
            true,
        )
    }

    fn reject(&self, conflict: Option<ConflictHint>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: self.last_log_index(),
            conflict,
        }
    }

    /// Handle a follower's reply. Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: &AppendEntriesResponse,
    ) -> bool {
        if self.observe_term(resp.term) {
            return false;
        }
        if self.state != NodeState::Leader || resp.term < self.current_term {
            return false;
        }

        let last_log_index = self.last_log_index();
        let Some(progress) = self
            .replication
            .as_mut()
            .and_then(|r| r.progress.get_mut(&from))
        else {
            return false;
        };
        progress.recent_active = true;

        if resp.success {
            let matched = resp.match_index.min(last_log_index);
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            return self.maybe_advance_commit();
        }

        let candidate = match resp.conflict {
            Some(ConflictHint { term: Some(term), index }) => self
                .log
                .last_index_of_term(term)
                .map(|last| last + 1)
                .unwrap_or(index),
            Some(ConflictHint { term: None, index }) => index,
            None => progress.next_index.saturating_sub(1),
        };
        progress.next_index = candidate
            .min(progress.next_index.saturating_sub(1))
            .max(progress.match_index + 1);
        tracing::debug!(
            node_id = self.id,
            peer_id = from,
            next_index = progress.next_index,
            "AppendEntries rejected, backing off"
        );
        false
    }

    /// Advance the commit index to the highest index held by a quorum, but
    /// only if that entry is from our own term. Counting replicas of an
    /// earlier-term entry is not enough: a later leader may still overwrite it.
    pub(crate) fn maybe_advance_commit(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let Some(replication) = self.replication.as_ref() else {
            return false;
        };
        let mut match_indexes: Vec<Index> =
            replication.progress.values().map(|p| p.match_index).collect();
        match_indexes.push(self.last_log_index());

        let quorum_index = self.cluster.quorum_index(match_indexes);
        if quorum_index <= self.commit_index
            || self.log.term_at(quorum_index) != Some(self.current_term)
        {
            return false;
        }
        self.commit_index = quorum_index;
        tracing::debug!(node_id = self.id, commit_index = quorum_index, "Updated commit index");
        true
    }

    /// Called once per quorum-check window while leading. If fewer than a
    /// quorum (counting ourselves) answered during the window, step down in
    /// the same term. Returns whether leadership was kept.
    pub fn check_quorum(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let Some(replication) = self.replication.as_mut() else {
            return false;
        };
        let mut active = vec![self.id];
        for (peer, progress) in replication.progress.iter_mut() {
            if progress.recent_active {
                active.push(*peer);
            }
            progress.recent_active = false;
        }
        if self.cluster.is_quorum(&active) {
            return true;
        }
        tracing::warn!(
            node_id = self.id,
            term = self.current_term,
            active = active.len(),
            quorum = self.quorum_size(),
            "Lost contact with quorum, stepping down"
        );
        self.become_follower(self.current_term, None);
        false
    }
}
