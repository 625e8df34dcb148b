//! One-vote-per-sender collection.

use concord_types::NodeId;
use std::collections::BTreeMap;

/// Collects at most one vote per sender.
///
/// A second vote from the same sender — equivocation or a benign re-send —
/// is ignored; the first registered vote stands. Iteration order is by
/// sender id, which keeps everything built from a vote set deterministic.
#[derive(Debug, Clone)]
pub struct VoteSet<T> {
    votes: BTreeMap<NodeId, T>,
}

impl<T> Default for VoteSet<T> {
    fn default() -> Self {
        Self {
            votes: BTreeMap::new(),
        }
    }
}

impl<T> VoteSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vote. Returns false if the sender already voted.
    pub fn register(&mut self, sender: NodeId, vote: T) -> bool {
        if self.votes.contains_key(&sender) {
            return false;
        }
        self.votes.insert(sender, vote);
        true
    }

    /// Whether the sender has voted.
    pub fn contains(&self, sender: NodeId) -> bool {
        self.votes.contains_key(&sender)
    }

    /// Number of registered votes.
    pub fn count(&self) -> usize {
        self.votes.len()
    }

    /// Number of votes satisfying the predicate.
    pub fn count_matching(&self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        self.votes.values().filter(|vote| predicate(vote)).count()
    }

    /// Votes in sender order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.votes.iter().map(|(id, vote)| (*id, vote))
    }

    /// Drop all votes.
    pub fn clear(&mut self) {
        self.votes.clear();
    }
}
