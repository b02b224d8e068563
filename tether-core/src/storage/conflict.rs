//! Conflict detection between inbound modifications and local changes.
//!
//! A conflict exists when the peer modifies an item that also appears in the
//! local change set for this session. The policy decides which side wins;
//! when the remote side wins, the local change is dropped from the set so it
//! is not sent back to the peer.

use serde::{Deserialize, Serialize};

use crate::storage::{LocalChanges, SyncItemKey};

/// Which side wins when both sides changed the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    PreferLocal,
    PreferRemote,
}

/// Resolves conflicts against one target's local change set.
#[derive(Debug)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        ConflictResolver { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Whether applying a remote modification to `key` collides with a local
    /// change of this session.
    pub fn is_conflict(&self, changes: &LocalChanges, key: &SyncItemKey) -> bool {
        !key.is_empty() && changes.contains(key)
    }

    pub fn local_side_wins(&self) -> bool {
        self.policy == ConflictPolicy::PreferLocal
    }

    /// Remote side won: drop the local change so it will not be re-sent.
    pub fn revert_local_change(&self, changes: &mut LocalChanges, key: &SyncItemKey) -> bool {
        changes.remove(key)
    }
}
