//! Client-role transitions and package composition.
//!
//! The client drives: it composes the initialization package, sends its
//! modifications after the server acknowledges the alerts, answers the
//! server's modifications with statuses and Map commands, and finalizes once
//! the server acknowledges those.

use tracing::{debug, warn};

use crate::proto::{ModificationType, Role, StatusCode};
use crate::response::{
    AlertPackage, LocalChangesPackage, OutboundItem, Package,
};
use crate::session::{SessionError, SessionHandler, SessionOutcome, SyncState};
use crate::sync_mode::{SyncMode, SyncType};
use crate::wire::{AlertParams, OutgoingMessage};

impl SessionHandler {
    /// Prepare targets from configuration and compose the initialization
    /// package (package #1 of the protocol).
    pub(crate) async fn client_initiate(&mut self) -> Result<OutgoingMessage, SessionError> {
        self.setup_session_local();
        self.set_state(SyncState::LocalInit);

        let pairs = self.config.database_pairs.clone();
        if pairs.is_empty() {
            return Err(SessionError::Config(crate::config::ConfigError::Invalid(
                "no database pairs configured".into(),
            )));
        }

        for pair in &pairs {
            let mode = self.config.sync_mode;
            let Some(index) = self.create_target(&pair.source, &pair.target, mode).await? else {
                warn!(database = %pair.source, "skipping unavailable datastore");
                continue;
            };

            // Without anchors from a previous session a fast sync cannot be
            // trusted; fall back to slow.
            let target = &mut self.targets[index];
            if target.sync_mode().sync_type() == SyncType::Fast
                && target.local_last_anchor().is_empty()
            {
                debug!(
                    database = %target.source_database(),
                    "no previous anchors, reverting to slow sync"
                );
                target.revert_sync_mode();
            }
        }

        if self.targets.is_empty() {
            return Err(SessionError::Storage(crate::storage::StorageError::NoStorage(
                "no datastores available for sync".into(),
            )));
        }

        self.compose_client_init();

        self.generate_response(true)
            .await?
            .ok_or_else(|| SessionError::Protocol("empty initialization package".into()))
    }

    /// Queue the sync alerts and the device-info exchange.
    fn compose_client_init(&mut self) {
        for target in &self.targets {
            self.generator.add_package(Package::Alert(AlertPackage::sync_init(
                target.sync_mode().to_alert_code(),
                target.source_database(),
                target.target_database(),
                target.local_last_anchor(),
                target.local_next_anchor(),
            )));
        }

        self.devinf.compose_exchange(
            Role::Client,
            &self.config,
            &self.targets,
            &self.codec,
            &mut self.generator,
        );
    }

    /// Server alerted us about a target: either a response to our alert
    /// (possibly downgrading the mode) or a server-initiated sync.
    pub(crate) async fn client_sync_alert(
        &mut self,
        mode: SyncMode,
        alert: &AlertParams,
    ) -> Result<StatusCode, SessionError> {
        // The server's alert addresses our database in Target.
        let local_uri = alert.target_database.clone().unwrap_or_default();
        let remote_uri = alert.source_database.clone().unwrap_or_default();

        let found = self.targets.iter().position(|t| {
            t.source_database() == local_uri
                || (!remote_uri.is_empty() && t.target_database() == remote_uri)
        });

        let index = match found {
            Some(index) => index,
            None => {
                use crate::sync_mode::SyncInitiator;
                if mode.initiator() != SyncInitiator::Server {
                    warn!(database = %local_uri, "alert for unknown database");
                    return Ok(StatusCode::NotFound);
                }
                // Server-initiated sync for a datastore we did not alert;
                // accept it when the pairing is configured.
                let Some(pair) = self.config.pair_for_source(&local_uri).cloned() else {
                    warn!(database = %local_uri, "server alerted unconfigured database");
                    return Ok(StatusCode::NotFound);
                };
                let target_uri = if remote_uri.is_empty() { pair.target.clone() } else { remote_uri };
                let mut negotiated = mode;
                negotiated.to_client_initiated();
                match self.create_target(&pair.source, &target_uri, negotiated).await? {
                    Some(index) => index,
                    None => return Ok(StatusCode::NotFound),
                }
            }
        };

        let target = &mut self.targets[index];

        // Adopt the server's view of the sync type; a slow-sync alert after
        // a fast request means anchors disagreed.
        if mode.sync_type() != target.sync_mode().sync_type() {
            debug!(
                database = %target.source_database(),
                requested = ?target.sync_mode().sync_type(),
                alerted = ?mode.sync_type(),
                "server changed sync type"
            );
            if mode.sync_type() == SyncType::Slow {
                target.revert_sync_mode();
            } else {
                let mut negotiated = mode;
                negotiated.to_client_initiated();
                target.set_sync_mode(negotiated);
            }
        }

        if let Some(next) = &alert.next_anchor {
            target.set_remote_next_anchor(next);
        }

        Ok(StatusCode::Success)
    }

    pub(crate) fn client_final_received(&mut self) {
        match self.state {
            // Server finished its initialization response.
            SyncState::LocalInit => self.set_state(SyncState::SendingItems),
            // Server finished sending its modifications.
            SyncState::SendingItems | SyncState::ReceivingItems => {
                self.set_state(SyncState::SendingMappings)
            }
            // Server acknowledged our mappings; nothing more to exchange.
            SyncState::SendingMappings => self.set_state(SyncState::Finalizing),
            _ => {}
        }
    }

    pub(crate) async fn client_message_parsed(&mut self) -> Result<SessionOutcome, SessionError> {
        match self.state {
            SyncState::SendingItems => {
                // Compose once; subsequent passes continue a package that
                // did not fit a single message.
                if !self.modifications_composed {
                    self.compose_local_changes_packages().await?;
                    self.modifications_composed = true;
                }
                let response = self.generate_response(true).await?;
                Ok(SessionOutcome { response, finished: false, busy: false })
            }
            SyncState::SendingMappings => {
                // Statuses for the server's items, plus any Map packages the
                // sync handling queued. This closes our package even when it
                // carries only statuses.
                let response = self.generate_response(true).await?;
                Ok(SessionOutcome { response, finished: false, busy: false })
            }
            SyncState::Finalizing => {
                self.finish_sync().await?;
                Ok(SessionOutcome { response: None, finished: true, busy: false })
            }
            SyncState::LocalInit | SyncState::ReceivingItems => {
                // Mid-phase: our own package stays open. Pending statuses
                // (and reactive work like device-info results) still go out.
                let response = if self.generator.has_pending_statuses()
                    || !self.generator.packages_empty()
                {
                    self.generate_response(false).await?
                } else {
                    None
                };
                Ok(SessionOutcome { response, finished: false, busy: false })
            }
            state if state.is_final() => {
                Ok(SessionOutcome { response: None, finished: true, busy: false })
            }
            _ => Ok(SessionOutcome { response: None, finished: false, busy: false }),
        }
    }

    /// Re-queue the package for the current phase (auth retry).
    pub(crate) async fn client_resend_package(&mut self) -> Result<(), SessionError> {
        debug!(state = ?self.state, "resending current package");
        match self.state {
            SyncState::LocalInit => {
                self.compose_client_init();
                Ok(())
            }
            SyncState::SendingItems => self.compose_local_changes_packages().await,
            _ => Ok(()),
        }
    }

    /// Build one local-changes package per target that has data to send.
    pub(crate) async fn compose_local_changes_packages(&mut self) -> Result<(), SessionError> {
        let role = self.role;
        let max_changes = self.config.max_changes_per_message;

        for index in 0..self.targets.len() {
            self.targets[index].discover_local_changes(role).await?;

            let items = build_outbound_items(&mut self.targets[index], role).await?;

            let target = &self.targets[index];
            debug!(
                database = %target.source_database(),
                items = items.len(),
                "queueing local changes"
            );
            self.generator.add_package(Package::LocalChanges(LocalChangesPackage::new(
                target.source_database(),
                target.target_database(),
                max_changes,
                items,
            )));
        }

        Ok(())
    }
}

/// Materialize a target's local changes as outbound items, fetching payloads
/// from the plugin.
pub(crate) async fn build_outbound_items(
    target: &mut crate::target::SyncTarget,
    role: Role,
) -> Result<Vec<OutboundItem>, SessionError> {
    let changes = target.local_changes().clone();

    let mut fetch_keys = changes.added.clone();
    fetch_keys.extend(changes.modified.iter().cloned());

    let fetched = if fetch_keys.is_empty() {
        Vec::new()
    } else {
        target.plugin_mut().get_items(&fetch_keys).await?
    };

    let default_mime = target.plugin().preferred_format().to_string();
    let mut items = Vec::new();

    for (key, fetched) in fetch_keys.iter().zip(fetched) {
        let Some(item) = fetched else {
            warn!(key = %key, "changed item disappeared from datastore, skipping");
            continue;
        };

        let modification = if changes.added.contains(key) {
            ModificationType::Addition
        } else {
            ModificationType::Modification
        };

        // Servers address the peer's copy through the mapping table;
        // clients always identify items by their own key.
        let remote_key = match (role, modification) {
            (Role::Server, ModificationType::Modification) => target.map_to_remote_uid(key),
            _ => None,
        };

        items.push(OutboundItem {
            modification,
            key: key.clone(),
            remote_key,
            parent_key: item.parent_key.clone(),
            mime: if item.mime.is_empty() { default_mime.clone() } else { item.mime.clone() },
            format: item.format.clone(),
            version: item.version.clone(),
            data: item.data.clone(),
        });
    }

    for key in &changes.removed {
        let remote_key = match role {
            Role::Server => target.map_to_remote_uid(key),
            Role::Client => None,
        };
        items.push(OutboundItem {
            modification: ModificationType::Deletion,
            key: key.clone(),
            remote_key,
            parent_key: None,
            mime: default_mime.clone(),
            format: None,
            version: None,
            data: Vec::new(),
        });
    }

    Ok(items)
}
