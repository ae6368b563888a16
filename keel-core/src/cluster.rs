//! Cluster membership view.
//!
//! Tracks the local member identity and the set of known remote members.
//! The remote set is replaced wholesale when a Configuration entry commits
//! or a snapshot is installed; the local member is never part of it.

use std::collections::BTreeSet;

/// Unique identifier for a cluster member.
pub type MemberId = String;

/// Local view of cluster membership.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: MemberId,
    remotes: BTreeSet<MemberId>,
}

impl ClusterView {
    /// Create a view for `local` with the given peers. `local` is filtered
    /// out of the remote set if present.
    pub fn new(local: MemberId, members: impl IntoIterator<Item = MemberId>) -> Self {
        let remotes = members.into_iter().filter(|m| *m != local).collect();
        Self { local, remotes }
    }

    /// The local member identity.
    pub fn local(&self) -> &MemberId {
        &self.local
    }

    /// Known remote members.
    pub fn remotes(&self) -> &BTreeSet<MemberId> {
        &self.remotes
    }

    /// Full membership, local member included.
    pub fn members(&self) -> BTreeSet<MemberId> {
        let mut all = self.remotes.clone();
        all.insert(self.local.clone());
        all
    }

    /// Whether `member` is part of the configured cluster.
    pub fn contains(&self, member: &MemberId) -> bool {
        *member == self.local || self.remotes.contains(member)
    }

    /// Strict majority of the full membership.
    pub fn quorum(&self) -> usize {
        (self.remotes.len() + 1) / 2 + 1
    }

    /// Replace the remote set with `members` minus the local member.
    pub fn replace_remotes(&mut self, members: &BTreeSet<MemberId>) {
        self.remotes = members.iter().filter(|m| **m != self.local).cloned().collect();
    }
}
