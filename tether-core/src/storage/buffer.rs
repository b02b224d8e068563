//! Per-message buffering of inbound modifications and their commit.
//!
//! Incoming Add/Replace/Delete items are buffered keyed by (command id, item
//! index) and drained once per peer message: additions first, then
//! replacements, then deletions, so later commands may reference items the
//! same message added. Large objects are assembled here chunk by chunk; only
//! one may be in progress at a time.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::proto::StatusCode;
use crate::storage::conflict::ConflictResolver;
use crate::storage::{LocalChanges, PluginStatus, StorageError, StoragePlugin, SyncItem, SyncItemKey};

/// Identity of one item within one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemId {
    pub cmd_id: u32,
    pub item_index: u32,
}

/// Outcome of committing one buffered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Added,
    Replaced,
    Deleted,
    /// Item was already present with identical content.
    Duplicate,
    /// Item to delete was not found.
    NotDeleted,
    UnsupportedFormat,
    ItemTooBig,
    NotEnoughSpace,
    GeneralError,
    /// Local side won the conflict before an add was attempted.
    InitAdd,
    /// Local side won the conflict before a replace was attempted.
    InitReplace,
    /// Local side won the conflict before a delete was attempted.
    InitDelete,
}

/// Conflict outcome attached to a commit result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    NoConflict,
    RemoteWin,
    LocalWin,
}

/// Result of one item commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub key: SyncItemKey,
    pub status: CommitStatus,
    pub conflict: ConflictOutcome,
}

impl CommitResult {
    /// Status code reported to the peer for this commit.
    pub fn response_code(&self) -> StatusCode {
        if self.conflict == ConflictOutcome::LocalWin {
            // Local data was preserved. Adds are answered "already exists",
            // replaces and deletes "resolved with client winning".
            return match self.status {
                CommitStatus::InitAdd => StatusCode::AlreadyExists,
                _ => StatusCode::ResolvedClientWinning,
            };
        }

        match self.status {
            CommitStatus::Added => StatusCode::ItemAdded,
            CommitStatus::Replaced | CommitStatus::Deleted => StatusCode::Success,
            CommitStatus::Duplicate => StatusCode::AlreadyExists,
            CommitStatus::NotDeleted => StatusCode::ItemNotDeleted,
            CommitStatus::UnsupportedFormat => StatusCode::UnsupportedFormat,
            CommitStatus::ItemTooBig => StatusCode::RequestEntityTooLarge,
            CommitStatus::NotEnoughSpace => StatusCode::DeviceFull,
            CommitStatus::GeneralError => StatusCode::CommandFailed,
            CommitStatus::InitAdd | CommitStatus::InitReplace | CommitStatus::InitDelete => {
                StatusCode::Success
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            CommitStatus::Added
                | CommitStatus::Replaced
                | CommitStatus::Deleted
                | CommitStatus::Duplicate
                | CommitStatus::InitAdd
                | CommitStatus::InitReplace
                | CommitStatus::InitDelete
        )
    }
}

/// Operation a large object resolves to once complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeObjectOp {
    Add,
    Replace,
}

#[derive(Error, Debug)]
pub enum LargeObjectError {
    #[error("another large object is already being assembled")]
    AlreadyInProgress,
    #[error("first chunk of a large object did not declare a size")]
    MissingSize,
    #[error("declared size {declared} exceeds storage limit {limit}")]
    TooBig { declared: u64, limit: u64 },
    #[error("no large object is being assembled")]
    NoObject,
    #[error("large object size mismatch: declared {declared}, assembled {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
}

#[derive(Debug)]
struct LargeObject {
    op: LargeObjectOp,
    /// Identity key: the remote key for adds, the local key for replaces.
    key: String,
    item: SyncItem,
    declared_size: u64,
}

/// Buffers one message's worth of modifications and commits them.
#[derive(Debug, Default)]
pub struct StorageBuffer {
    add_items: BTreeMap<ItemId, SyncItem>,
    replace_items: BTreeMap<ItemId, SyncItem>,
    delete_items: BTreeMap<ItemId, SyncItemKey>,
    large_object: Option<LargeObject>,
}

impl StorageBuffer {
    pub fn new() -> Self {
        StorageBuffer::default()
    }

    /// Buffer an item for addition.
    pub fn add_item(&mut self, id: ItemId, item: SyncItem) {
        self.add_items.insert(id, item);
    }

    /// Buffer an item for replacement. An item without a local key cannot be
    /// replaced; it is treated as an addition. This mirrors deployed servers
    /// that send Replace for items the client has never seen.
    pub fn replace_item(&mut self, id: ItemId, item: SyncItem) {
        match &item.key {
            Some(key) if !key.is_empty() => {
                self.replace_items.insert(id, item);
            }
            _ => {
                debug!(cmd_id = id.cmd_id, "replace without local key, buffering as add");
                self.add_items.insert(id, item);
            }
        }
    }

    /// Buffer a deletion by local key.
    pub fn delete_item(&mut self, id: ItemId, key: SyncItemKey) {
        self.delete_items.insert(id, key);
    }

    pub fn has_buffered_items(&self) -> bool {
        !self.add_items.is_empty() || !self.replace_items.is_empty() || !self.delete_items.is_empty()
    }

    /// Begin assembling a large object. `max_object_size` is the plugin's
    /// limit (0 for unlimited); oversized declarations are rejected up front.
    pub fn start_large_object(
        &mut self,
        op: LargeObjectOp,
        key: String,
        mut item: SyncItem,
        declared_size: Option<u64>,
        max_object_size: u64,
    ) -> Result<(), LargeObjectError> {
        if self.large_object.is_some() {
            self.abort_large_object();
            return Err(LargeObjectError::AlreadyInProgress);
        }

        let declared = declared_size.ok_or(LargeObjectError::MissingSize)?;

        if max_object_size > 0 && declared > max_object_size {
            return Err(LargeObjectError::TooBig { declared, limit: max_object_size });
        }

        debug!(key = %key, declared, ?op, "starting large object");

        item.data.clear();
        self.large_object = Some(LargeObject { op, key, item, declared_size: declared });

        Ok(())
    }

    pub fn building_large_object(&self) -> bool {
        self.large_object.is_some()
    }

    /// Check the next chunk's key against the object under assembly. A
    /// mismatch aborts the object.
    pub fn matches_large_object(&mut self, key: &str) -> bool {
        match &self.large_object {
            Some(lo) if lo.key == key => true,
            Some(lo) => {
                warn!(expected = %lo.key, got = %key, "large object interrupted by another item");
                self.abort_large_object();
                false
            }
            None => false,
        }
    }

    /// Append a chunk to the object under assembly.
    pub fn append_large_object_data(&mut self, data: &[u8]) -> Result<(), LargeObjectError> {
        let lo = self.large_object.as_mut().ok_or(LargeObjectError::NoObject)?;
        lo.item.data.extend_from_slice(data);
        Ok(())
    }

    /// Final chunk received: verify the assembled length against the declared
    /// size and move the item into the appropriate buffer. The object is
    /// dropped either way.
    pub fn finish_large_object(&mut self, id: ItemId) -> Result<(), LargeObjectError> {
        let lo = self.large_object.take().ok_or(LargeObjectError::NoObject)?;

        let actual = lo.item.data.len() as u64;
        if actual != lo.declared_size {
            warn!(declared = lo.declared_size, actual, "large object size mismatch");
            return Err(LargeObjectError::SizeMismatch { declared: lo.declared_size, actual });
        }

        debug!(key = %lo.key, size = actual, "large object complete");

        match lo.op {
            LargeObjectOp::Add => self.add_items.insert(id, lo.item),
            LargeObjectOp::Replace => self.replace_items.insert(id, lo.item),
        };

        Ok(())
    }

    pub fn abort_large_object(&mut self) {
        if self.large_object.take().is_some() {
            debug!("large object aborted");
        }
    }

    /// Commit buffered additions. Conflicting items are decided by the
    /// resolver before the plugin sees the batch.
    pub async fn commit_added_items(
        &mut self,
        plugin: &mut dyn StoragePlugin,
        resolver: &ConflictResolver,
        local_changes: &mut LocalChanges,
    ) -> Result<BTreeMap<ItemId, CommitResult>, StorageError> {
        let buffered = std::mem::take(&mut self.add_items);
        let mut results = BTreeMap::new();
        let mut batch_ids = Vec::new();
        let mut batch_items = Vec::new();

        for (id, item) in buffered {
            let key = item.key.clone().unwrap_or_default();
            let conflict = self.decide_conflict(resolver, local_changes, &key);
            if conflict == ConflictOutcome::LocalWin {
                results.insert(id, CommitResult { key, status: CommitStatus::InitAdd, conflict });
                continue;
            }
            batch_ids.push((id, conflict));
            batch_items.push(item);
        }

        if !batch_items.is_empty() {
            let committed = plugin.add_items(&batch_items).await?;
            for ((id, conflict), outcome) in batch_ids.into_iter().zip(committed) {
                let status = match outcome.status {
                    PluginStatus::Ok => CommitStatus::Added,
                    other => plugin_failure(other),
                };
                results.insert(
                    id,
                    CommitResult { key: outcome.key.unwrap_or_default(), status, conflict },
                );
            }
        }

        Ok(results)
    }

    /// Commit buffered replacements.
    pub async fn commit_replaced_items(
        &mut self,
        plugin: &mut dyn StoragePlugin,
        resolver: &ConflictResolver,
        local_changes: &mut LocalChanges,
    ) -> Result<BTreeMap<ItemId, CommitResult>, StorageError> {
        let buffered = std::mem::take(&mut self.replace_items);
        let mut results = BTreeMap::new();
        let mut batch_ids = Vec::new();
        let mut batch_items = Vec::new();

        for (id, item) in buffered {
            let key = item.key.clone().unwrap_or_default();
            let conflict = self.decide_conflict(resolver, local_changes, &key);
            if conflict == ConflictOutcome::LocalWin {
                results.insert(id, CommitResult { key, status: CommitStatus::InitReplace, conflict });
                continue;
            }
            batch_ids.push((id, conflict));
            batch_items.push(item);
        }

        if !batch_items.is_empty() {
            let committed = plugin.replace_items(&batch_items).await?;
            for ((id, conflict), outcome) in batch_ids.into_iter().zip(committed) {
                let status = match outcome.status {
                    PluginStatus::Ok => CommitStatus::Replaced,
                    other => plugin_failure(other),
                };
                results.insert(
                    id,
                    CommitResult { key: outcome.key.unwrap_or_default(), status, conflict },
                );
            }
        }

        Ok(results)
    }

    /// Commit buffered deletions.
    pub async fn commit_deleted_items(
        &mut self,
        plugin: &mut dyn StoragePlugin,
        resolver: &ConflictResolver,
        local_changes: &mut LocalChanges,
    ) -> Result<BTreeMap<ItemId, CommitResult>, StorageError> {
        let buffered = std::mem::take(&mut self.delete_items);
        let mut results = BTreeMap::new();
        let mut batch_ids = Vec::new();
        let mut batch_keys = Vec::new();

        for (id, key) in buffered {
            let conflict = self.decide_conflict(resolver, local_changes, &key);
            if conflict == ConflictOutcome::LocalWin {
                results.insert(id, CommitResult { key, status: CommitStatus::InitDelete, conflict });
                continue;
            }
            batch_ids.push((id, conflict));
            batch_keys.push(key);
        }

        if !batch_keys.is_empty() {
            let committed = plugin.delete_items(&batch_keys).await?;
            for (((id, conflict), key), status) in
                batch_ids.into_iter().zip(batch_keys).zip(committed)
            {
                let status = match status {
                    PluginStatus::Ok => CommitStatus::Deleted,
                    PluginStatus::NotFound => CommitStatus::NotDeleted,
                    other => plugin_failure(other),
                };
                results.insert(id, CommitResult { key, status, conflict });
            }
        }

        Ok(results)
    }

    fn decide_conflict(
        &self,
        resolver: &ConflictResolver,
        local_changes: &mut LocalChanges,
        key: &SyncItemKey,
    ) -> ConflictOutcome {
        if !resolver.is_conflict(local_changes, key) {
            return ConflictOutcome::NoConflict;
        }
        if resolver.local_side_wins() {
            debug!(key = %key, "conflict resolved: local side wins");
            ConflictOutcome::LocalWin
        } else {
            debug!(key = %key, "conflict resolved: remote side wins");
            resolver.revert_local_change(local_changes, key);
            ConflictOutcome::RemoteWin
        }
    }
}

fn plugin_failure(status: PluginStatus) -> CommitStatus {
    match status {
        PluginStatus::Duplicate => CommitStatus::Duplicate,
        PluginStatus::NotFound => CommitStatus::GeneralError,
        PluginStatus::UnsupportedFormat => CommitStatus::UnsupportedFormat,
        PluginStatus::ItemTooBig => CommitStatus::ItemTooBig,
        PluginStatus::QuotaExceeded => CommitStatus::NotEnoughSpace,
        PluginStatus::Ok | PluginStatus::Error => CommitStatus::GeneralError,
    }
}
