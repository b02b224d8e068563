//! Processing of inbound item-bearing commands.
//!
//! The processor routes a Sync container's children into the storage buffer
//! (assembling large objects on the way), commits the buffers against the
//! target's plugin, and emits one status per item in arrival order. Map
//! commands are recorded onto the target. The processor borrows everything
//! it touches for the duration of a call; ownership stays with the session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::persist::changelog::UidMapping;
use crate::proto::{Role, StatusCode};
use crate::response::{status_for_command, ResponseGenerator};
use crate::storage::buffer::{
    CommitResult, ItemId, LargeObjectError, LargeObjectOp, StorageBuffer,
};
use crate::storage::conflict::ConflictResolver;
use crate::storage::{StorageError, SyncItem, SyncItemKey};
use crate::target::SyncTarget;
use crate::wire::{CommandKind, CommandParams, ItemParams, MapParams, SyncParams};

/// Outcome of processing one Sync container.
#[derive(Debug, Default)]
pub struct SyncCommandOutcome {
    /// Mappings created by successful adds (local key, peer key).
    pub new_mappings: Vec<UidMapping>,
    /// Commit results for progress accounting, in item order.
    pub committed: Vec<(ItemId, CommitResult)>,
}

/// Handles individual commands on behalf of the session.
pub struct CommandProcessor {
    role: Role,
}

impl CommandProcessor {
    pub fn new(role: Role) -> Self {
        CommandProcessor { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Record the mappings of a Map command onto the target and acknowledge.
    pub fn process_map(
        &self,
        map: &MapParams,
        msg_id: u32,
        target: &mut SyncTarget,
        generator: &mut ResponseGenerator,
    ) -> StatusCode {
        for map_item in &map.map_items {
            debug!(
                local = %map_item.target,
                remote = %map_item.source,
                "recording uid mapping from map command"
            );
            // The peer addresses our keys through Target and its own through
            // Source.
            target.add_uid_mapping(UidMapping {
                local_uid: map_item.target.clone(),
                remote_uid: map_item.source.clone(),
            });
        }

        let mut status = status_for_command(msg_id, map.cmd_id, "Map", StatusCode::Success);
        status.target_ref = Some(map.target.clone());
        status.source_ref = Some(map.source.clone());
        generator.add_status(status);

        StatusCode::Success
    }

    /// Reject a Sync container outright with `code`, one status for the
    /// container and one per child item.
    pub fn reject_sync(
        &self,
        sync: &SyncParams,
        msg_id: u32,
        generator: &mut ResponseGenerator,
        code: StatusCode,
    ) {
        let mut status = status_for_command(msg_id, sync.cmd_id, "Sync", code);
        status.target_ref = Some(sync.target_database.clone());
        status.source_ref = Some(sync.source_database.clone());
        generator.add_status(status);

        for command in &sync.commands {
            for item in &command.items {
                let mut status =
                    status_for_command(msg_id, command.cmd_id, command.kind.element_name(), code);
                status.source_ref = item.source.clone();
                status.target_ref = item.target.clone();
                generator.add_status(status);
            }
        }
    }

    /// Process one Sync container: buffer children, commit, emit statuses.
    pub async fn process_sync(
        &self,
        sync: &SyncParams,
        msg_id: u32,
        target: &mut SyncTarget,
        buffer: &mut StorageBuffer,
        generator: &mut ResponseGenerator,
        resolver: &ConflictResolver,
    ) -> Result<SyncCommandOutcome, StorageError> {
        // Aggregate status for the container itself.
        let mut container_status =
            status_for_command(msg_id, sync.cmd_id, "Sync", StatusCode::Success);
        container_status.target_ref = Some(sync.target_database.clone());
        container_status.source_ref = Some(sync.source_database.clone());
        generator.add_status(container_status);

        // Kind and remote key per buffered item, for status element names
        // and for building mappings after commit.
        let mut routed: Vec<(ItemId, CommandKind, Option<String>)> = Vec::new();

        for command in &sync.commands {
            match command.kind {
                CommandKind::Add | CommandKind::Replace | CommandKind::Delete => {}
                other => {
                    // Get/Put do not belong inside a Sync container.
                    warn!(kind = ?other, "unsupported command inside sync container");
                    generator.add_status(status_for_command(
                        msg_id,
                        command.cmd_id,
                        other.element_name(),
                        StatusCode::NotSupported,
                    ));
                    continue;
                }
            }

            for (index, item) in command.items.iter().enumerate() {
                let id = ItemId { cmd_id: command.cmd_id, item_index: index as u32 };
                match self.route_item(command, item, id, target, buffer) {
                    ItemRouting::Buffered { remote_key } => {
                        routed.push((id, command.kind, remote_key));
                    }
                    ItemRouting::Immediate(code) => {
                        let mut status = status_for_command(
                            msg_id,
                            command.cmd_id,
                            command.kind.element_name(),
                            code,
                        );
                        status.source_ref = item.source.clone();
                        status.target_ref = item.target.clone();
                        generator.add_status(status);
                    }
                }
            }
        }

        // Commit in add, replace, delete order so intra-message references
        // to fresh items resolve.
        let mut outcome = SyncCommandOutcome::default();
        let (plugin, local_changes) = target.commit_parts();

        let added = buffer.commit_added_items(plugin, resolver, local_changes).await?;
        let replaced = buffer.commit_replaced_items(plugin, resolver, local_changes).await?;
        let deleted = buffer.commit_deleted_items(plugin, resolver, local_changes).await?;

        for (id, result) in added.into_iter().chain(replaced).chain(deleted) {
            let route = routed.iter().find(|(rid, _, _)| *rid == id);
            let element = route.map_or("Replace", |(_, kind, _)| kind.element_name());

            let mut status =
                status_for_command(msg_id, id.cmd_id, element, result.response_code());
            if !result.key.is_empty() {
                status.source_ref = Some(result.key.clone());
            }
            generator.add_status(status);

            if result.is_success() {
                if let Some((_, _, remote_key)) = route {
                    self.manage_mapping(&result, remote_key.as_deref(), target, &mut outcome);
                }
            }

            outcome.committed.push((id, result));
        }

        Ok(outcome)
    }

    /// Route one inbound item into the buffer, or produce an immediate
    /// status for chunks and errors.
    fn route_item(
        &self,
        command: &CommandParams,
        item: &ItemParams,
        id: ItemId,
        target: &mut SyncTarget,
        buffer: &mut StorageBuffer,
    ) -> ItemRouting {
        let local_key = self.resolve_local_key(command.kind, item, target);
        let remote_key = item.source.clone();

        // Identity of a large object: the peer-visible key of the item.
        let identity = match command.kind {
            CommandKind::Add => remote_key.clone().unwrap_or_default(),
            _ => local_key.clone().unwrap_or_default(),
        };

        if buffer.building_large_object() {
            if buffer.matches_large_object(&identity) {
                if let Err(e) = buffer.append_large_object_data(&item_data(command, item)) {
                    warn!(error = %e, "could not append large object data");
                    return ItemRouting::Immediate(StatusCode::CommandFailed);
                }
                if item.more_data {
                    return ItemRouting::Immediate(StatusCode::ChunkedItemAccepted);
                }
                return match buffer.finish_large_object(id) {
                    Ok(()) => ItemRouting::Buffered { remote_key },
                    Err(LargeObjectError::SizeMismatch { declared, actual }) => {
                        warn!(declared, actual, "large object size mismatch");
                        ItemRouting::Immediate(StatusCode::SizeMismatch)
                    }
                    Err(e) => {
                        warn!(error = %e, "could not finish large object");
                        ItemRouting::Immediate(StatusCode::CommandFailed)
                    }
                };
            }
            // The buffer aborted the mismatched object; the interrupting
            // item failed the protocol.
            return ItemRouting::Immediate(StatusCode::CommandFailed);
        }

        if item.more_data {
            // First chunk of a new large object.
            let op = match command.kind {
                CommandKind::Add => LargeObjectOp::Add,
                CommandKind::Replace => LargeObjectOp::Replace,
                CommandKind::Delete => {
                    warn!("delete command cannot carry a large object");
                    return ItemRouting::Immediate(StatusCode::BadRequest);
                }
                _ => return ItemRouting::Immediate(StatusCode::NotSupported),
            };

            let declared_size = item.meta.size.or(command.meta.size);
            let template = self.build_item(command, item, local_key.clone(), Vec::new());
            let max_object_size = target.plugin().max_object_size();

            return match buffer.start_large_object(op, identity, template, declared_size, max_object_size)
            {
                Ok(()) => {
                    if let Err(e) = buffer.append_large_object_data(&item_data(command, item)) {
                        warn!(error = %e, "could not buffer first chunk");
                        return ItemRouting::Immediate(StatusCode::CommandFailed);
                    }
                    ItemRouting::Immediate(StatusCode::ChunkedItemAccepted)
                }
                Err(LargeObjectError::MissingSize) => {
                    warn!("large object started without declared size");
                    ItemRouting::Immediate(StatusCode::SizeRequired)
                }
                Err(LargeObjectError::TooBig { declared, limit }) => {
                    warn!(declared, limit, "large object exceeds storage limit");
                    ItemRouting::Immediate(StatusCode::RequestEntityTooLarge)
                }
                Err(e) => {
                    warn!(error = %e, "could not start large object");
                    ItemRouting::Immediate(StatusCode::CommandFailed)
                }
            };
        }

        // Plain single-message item.
        match command.kind {
            CommandKind::Add => {
                let sync_item = self.build_item(command, item, None, item_data(command, item));
                buffer.add_item(id, sync_item);
            }
            CommandKind::Replace => {
                let sync_item =
                    self.build_item(command, item, local_key, item_data(command, item));
                buffer.replace_item(id, sync_item);
            }
            CommandKind::Delete => {
                buffer.delete_item(id, local_key.unwrap_or_default());
            }
            _ => unreachable!("filtered above"),
        }

        ItemRouting::Buffered { remote_key }
    }

    /// Resolve the local key an inbound Replace/Delete refers to. The peer
    /// either addresses our key directly (Target) or uses its own key
    /// (Source), which the mapping table translates.
    fn resolve_local_key(
        &self,
        kind: CommandKind,
        item: &ItemParams,
        target: &SyncTarget,
    ) -> Option<SyncItemKey> {
        if kind == CommandKind::Add {
            return None;
        }

        if let Some(local) = &item.target {
            if !local.is_empty() {
                return Some(local.clone());
            }
        }

        let remote = item.source.as_deref()?;
        match target.map_to_local_uid(remote) {
            Some(local) => Some(local),
            // No mapping: fall back to the raw key, the datastore may share
            // the peer's key space.
            None => Some(remote.to_string()),
        }
    }

    fn build_item(
        &self,
        command: &CommandParams,
        item: &ItemParams,
        key: Option<SyncItemKey>,
        data: Vec<u8>,
    ) -> SyncItem {
        SyncItem {
            key,
            parent_key: item
                .target_parent
                .clone()
                .or_else(|| item.source_parent.clone()),
            mime: item
                .meta
                .mime
                .clone()
                .or_else(|| command.meta.mime.clone())
                .unwrap_or_default(),
            format: item.meta.format.clone().or_else(|| command.meta.format.clone()),
            version: item.meta.version.clone().or_else(|| command.meta.version.clone()),
            data,
        }
    }

    /// Maintain the mapping table after a successful commit. Successful adds
    /// create a mapping; successful deletes retire theirs.
    fn manage_mapping(
        &self,
        result: &CommitResult,
        remote_key: Option<&str>,
        target: &mut SyncTarget,
        outcome: &mut SyncCommandOutcome,
    ) {
        use crate::storage::buffer::CommitStatus;

        match result.status {
            CommitStatus::Added => {
                let Some(remote) = remote_key else {
                    return;
                };
                let mapping =
                    UidMapping { local_uid: result.key.clone(), remote_uid: remote.to_string() };
                target.add_uid_mapping(mapping.clone());
                outcome.new_mappings.push(mapping);
            }
            CommitStatus::Deleted => {
                target.remove_uid_mapping(&result.key);
            }
            _ => {}
        }
    }
}

enum ItemRouting {
    /// Item landed in a buffer; its status comes from the commit.
    Buffered { remote_key: Option<String> },
    /// Status already determined (chunk accepted, protocol error).
    Immediate(StatusCode),
}

/// Item payload with its transfer encoding undone.
fn item_data(command: &CommandParams, item: &ItemParams) -> Vec<u8> {
    let format = item
        .meta
        .format
        .as_deref()
        .or(command.meta.format.as_deref())
        .unwrap_or("");

    if format == crate::proto::FORMAT_ENCODING_B64 || format == crate::proto::FORMAT_ENCODING_BIN {
        match BASE64.decode(&item.data) {
            Ok(decoded) => decoded,
            Err(_) => {
                warn!("item data declared b64 but does not decode, passing through raw");
                item.data.clone()
            }
        }
    } else {
        item.data.clone()
    }
}
