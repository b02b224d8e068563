//! Runtime state of one datastore pairing within a session.
//!
//! A target owns its storage plugin and its change log for the duration of
//! the session. Local changes are discovered exactly once; UID mappings are
//! loaded from the change log at setup and written back on successful
//! finalization. Anchors advance only through [`SyncTarget::save_session`].

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::persist::changelog::{ChangeLog, UidMapping};
use crate::persist::{Database, PersistError};
use crate::proto::Role;
use crate::storage::{LocalChanges, StorageError, StoragePlugin, SyncItemKey};
use crate::sync_mode::{SyncDirection, SyncMode, SyncType};

pub struct SyncTarget {
    plugin: Box<dyn StoragePlugin>,
    change_log: ChangeLog,
    sync_mode: SyncMode,
    /// Remote database URI.
    target_database: String,
    local_next_anchor: String,
    remote_next_anchor: String,
    reverted: bool,
    local_changes: LocalChanges,
    local_changes_discovered: bool,
    uid_mappings: Vec<UidMapping>,
}

impl SyncTarget {
    pub fn new(
        change_log: ChangeLog,
        plugin: Box<dyn StoragePlugin>,
        sync_mode: SyncMode,
        local_next_anchor: &str,
    ) -> Self {
        let uid_mappings = change_log.maps().to_vec();
        SyncTarget {
            plugin,
            change_log,
            sync_mode,
            target_database: String::new(),
            local_next_anchor: local_next_anchor.to_string(),
            remote_next_anchor: String::new(),
            reverted: false,
            local_changes: LocalChanges::default(),
            local_changes_discovered: false,
            uid_mappings,
        }
    }

    /// Local database URI, as the plugin names it.
    pub fn source_database(&self) -> &str {
        self.plugin.source_uri()
    }

    pub fn target_database(&self) -> &str {
        &self.target_database
    }

    pub fn set_target_database(&mut self, uri: &str) {
        self.target_database = uri.to_string();
    }

    pub fn local_last_anchor(&self) -> &str {
        self.change_log.last_local_anchor()
    }

    pub fn local_next_anchor(&self) -> &str {
        &self.local_next_anchor
    }

    pub fn remote_last_anchor(&self) -> &str {
        self.change_log.last_remote_anchor()
    }

    pub fn remote_next_anchor(&self) -> &str {
        &self.remote_next_anchor
    }

    pub fn set_remote_next_anchor(&mut self, anchor: &str) {
        self.remote_next_anchor = anchor.to_string();
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.change_log.last_sync_time()
    }

    pub fn sync_mode(&self) -> &SyncMode {
        &self.sync_mode
    }

    pub fn sync_mode_mut(&mut self) -> &mut SyncMode {
        &mut self.sync_mode
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    /// Downgrade a fast sync to slow and mark the target reverted.
    pub fn revert_sync_mode(&mut self) {
        if self.sync_mode.sync_type() == SyncType::Fast {
            self.sync_mode.to_slow_sync();
            self.reverted = true;
        }
    }

    /// Switch a client-initiated from-client sync to refresh mode.
    pub fn set_refresh_from_client(&mut self) -> bool {
        use crate::sync_mode::SyncInitiator;
        if self.sync_mode.direction() == SyncDirection::FromClient
            && self.sync_mode.initiator() == SyncInitiator::Client
        {
            self.sync_mode.set_refresh();
            true
        } else {
            false
        }
    }

    pub fn reverted(&self) -> bool {
        self.reverted
    }

    pub fn plugin(&self) -> &dyn StoragePlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn StoragePlugin {
        self.plugin.as_mut()
    }

    /// Split borrows for the commit path, which needs the plugin and the
    /// local-change set at the same time.
    pub fn commit_parts(&mut self) -> (&mut dyn StoragePlugin, &mut LocalChanges) {
        (self.plugin.as_mut(), &mut self.local_changes)
    }

    /// Ask the plugin for this session's local changes. Discovery happens at
    /// most once; subsequent calls are no-ops.
    pub async fn discover_local_changes(&mut self, role: Role) -> Result<(), StorageError> {
        if self.local_changes_discovered {
            return Ok(());
        }

        self.local_changes = LocalChanges::default();

        let direction = self.sync_mode.direction();
        let sends_data = direction == SyncDirection::TwoWay
            || (role == Role::Client && direction == SyncDirection::FromClient)
            || (role == Role::Server && direction == SyncDirection::FromServer);

        if sends_data {
            match self.sync_mode.sync_type() {
                SyncType::Slow => {
                    debug!(database = %self.plugin.source_uri(), "slow sync, sending all items");
                    self.local_changes.added = self.plugin.get_all().await?;
                }
                SyncType::Refresh => {
                    // As server we never initiate a refresh of the peer.
                    if role == Role::Client && direction == SyncDirection::FromClient {
                        debug!(database = %self.plugin.source_uri(), "refresh sync, sending all items");
                        self.local_changes.added = self.plugin.get_all().await?;
                    }
                }
                SyncType::Fast => match self.change_log.last_sync_time() {
                    Some(since) => {
                        debug!(
                            database = %self.plugin.source_uri(),
                            since = %since,
                            "fast sync, fetching modifications"
                        );
                        self.local_changes = self.plugin.get_modifications(since).await?;
                    }
                    None => {
                        // First sync against this pairing: everything is new.
                        debug!(database = %self.plugin.source_uri(), "first fast sync, sending all items");
                        self.local_changes.added = self.plugin.get_all().await?;
                    }
                },
            }
        } else {
            debug!(database = %self.plugin.source_uri(), "local changes not needed in current sync mode");
        }

        debug!(
            database = %self.plugin.source_uri(),
            added = self.local_changes.added.len(),
            modified = self.local_changes.modified.len(),
            removed = self.local_changes.removed.len(),
            "local changes discovered"
        );

        self.local_changes_discovered = true;

        Ok(())
    }

    pub fn local_changes(&self) -> &LocalChanges {
        &self.local_changes
    }

    pub fn local_changes_mut(&mut self) -> &mut LocalChanges {
        &mut self.local_changes
    }

    pub fn add_uid_mapping(&mut self, mapping: UidMapping) {
        self.uid_mappings.push(mapping);
    }

    pub fn remove_uid_mapping(&mut self, local_key: &SyncItemKey) {
        if let Some(pos) = self.uid_mappings.iter().position(|m| &m.local_uid == local_key) {
            self.uid_mappings.remove(pos);
        }
    }

    /// Translate a remote key to the local one, if a mapping exists.
    pub fn map_to_local_uid(&self, remote_key: &str) -> Option<SyncItemKey> {
        let found = self
            .uid_mappings
            .iter()
            .find(|m| m.remote_uid == remote_key)
            .map(|m| m.local_uid.clone());
        if found.is_none() {
            debug!(remote_key = %remote_key, "no existing mapping found for remote key");
        }
        found
    }

    /// Translate a local key to the remote one, if a mapping exists.
    pub fn map_to_remote_uid(&self, local_key: &SyncItemKey) -> Option<String> {
        self.uid_mappings
            .iter()
            .find(|m| &m.local_uid == local_key)
            .map(|m| m.remote_uid.clone())
    }

    pub fn uid_mappings(&self) -> &[UidMapping] {
        &self.uid_mappings
    }

    pub fn clear_uid_mappings(&mut self) {
        self.uid_mappings.clear();
    }

    /// Persist this target's session outcome: next anchors become last
    /// anchors and the mapping table is rewritten.
    pub async fn save_session(
        &mut self,
        db: &Database,
        sync_end_time: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        self.change_log.set_last_local_anchor(&self.local_next_anchor);
        self.change_log.set_last_remote_anchor(&self.remote_next_anchor);
        self.change_log.set_last_sync_time(sync_end_time);
        self.change_log.set_maps(self.uid_mappings.clone());

        if let Err(e) = self.change_log.save(db).await {
            warn!(error = %e, "could not save change log to persistent storage");
            return Err(e);
        }

        Ok(())
    }
}
