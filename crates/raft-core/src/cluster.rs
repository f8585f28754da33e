//! # cluster
//!
//! why: majority arithmetic over the fixed voter set
//! relations: used by election.rs for vote counting, replication.rs for commit
//! what: ClusterView, quorum size, quorum value of match indexes

use std::collections::BTreeSet;

use crate::{Index, NodeId};

/// The fixed, known set of voting members, including the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    local: NodeId,
    members: BTreeSet<NodeId>,
}

impl ClusterView {
    /// The local node is always a member, whether or not `members` lists it.
    pub fn new(local: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: BTreeSet<NodeId> = members.into_iter().collect();
        members.insert(local);
        Self { local, members }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    /// Every member except the local node.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let local = self.local;
        self.members.iter().copied().filter(move |&id| id != local)
    }

    /// Strict majority: floor(n / 2) + 1
    pub fn quorum_size(&self) -> usize {
        self.size() / 2 + 1
    }

    /// Whether the given voters (non-members ignored) form a majority.
    pub fn is_quorum<'a>(&self, voters: impl IntoIterator<Item = &'a NodeId>) -> bool {
        voters.into_iter().filter(|id| self.contains(**id)).count() >= self.quorum_size()
    }

    /// The highest index held by at least a quorum, given one match index per
    /// member (the leader passes its own last index for itself).
    pub fn quorum_index(&self, mut match_indexes: Vec<Index>) -> Index {
        debug_assert_eq!(match_indexes.len(), self.size(), "one match index per member");
        match_indexes.sort_unstable_by(|a, b| b.cmp(a));
        match_indexes
            .get(self.quorum_size() - 1)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(ClusterView::new(1, [1]).quorum_size(), 1);
        assert_eq!(ClusterView::new(1, [1, 2]).quorum_size(), 2);
        assert_eq!(ClusterView::new(1, [1, 2, 3]).quorum_size(), 2);
        assert_eq!(ClusterView::new(1, [1, 2, 3, 4]).quorum_size(), 3);
        assert_eq!(ClusterView::new(1, [1, 2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(ClusterView::new(1, 1..=7).quorum_size(), 4);
    }

    #[test]
    fn local_node_always_member() {
        let view = ClusterView::new(4, [1, 2, 3]);
        assert_eq!(view.size(), 4);
        assert_eq!(view.peers().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn strangers_do_not_count_toward_quorum() {
        let view = ClusterView::new(1, [1, 2, 3]);
        assert!(!view.is_quorum(&[1, 9]));
        assert!(view.is_quorum(&[1, 3]));
    }

    #[test]
    fn quorum_index_is_majority_median() {
        let view = ClusterView::new(1, [1, 2, 3, 4, 5]);
        assert_eq!(view.quorum_index(vec![9, 0, 7, 3, 7]), 7);
        assert_eq!(view.quorum_index(vec![9, 0, 0, 3, 1]), 1);
        let three = ClusterView::new(1, [1, 2, 3]);
        assert_eq!(three.quorum_index(vec![5, 5, 0]), 5);
    }
}
