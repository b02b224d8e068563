//! Server-role transitions and package composition.
//!
//! The server follows: it accepts the client's initialization, acknowledges
//! each alerted target, receives the client's modifications, answers with
//! its own, collects Map commands and finalizes with the map
//! acknowledgements.

use tracing::{debug, warn};

use crate::proto::{Role, StatusCode};
use crate::response::{AlertPackage, LocalChangesPackage, Package};
use crate::session::client::build_outbound_items;
use crate::session::{SessionError, SessionHandler, SessionOutcome, SyncState};
use crate::sync_mode::{SyncMode, SyncType};
use crate::wire::{AlertParams, SyncParams};

impl SessionHandler {
    /// Client alerted a database pairing: create (or find) the target,
    /// negotiate the mode and verify anchors.
    pub(crate) async fn server_sync_alert(
        &mut self,
        mode: SyncMode,
        alert: &AlertParams,
    ) -> Result<StatusCode, SessionError> {
        if self.state != SyncState::RemoteInit {
            warn!(state = ?self.state, "sync alert outside initialization");
            return Ok(StatusCode::CommandNotAllowed);
        }

        // The client's alert addresses our database in Target and names its
        // own in Source.
        let local_uri = alert.target_database.clone().unwrap_or_default();
        let remote_uri = alert.source_database.clone().unwrap_or_default();

        if local_uri.is_empty() {
            return Ok(StatusCode::IncompleteCommand);
        }

        let Some(index) = self.create_target(&local_uri, &remote_uri, mode).await? else {
            warn!(database = %local_uri, "alert for unknown or disabled database");
            return Ok(StatusCode::NotFound);
        };

        let remote_last = alert.last_anchor.clone().unwrap_or_default();
        let target = &mut self.targets[index];

        if !remote_uri.is_empty() {
            target.set_target_database(&remote_uri);
        }

        // Anchor disagreement forces a slow sync.
        if mode.sync_type() == SyncType::Fast && Self::anchor_mismatch(target, &remote_last) {
            debug!(
                database = %target.source_database(),
                presented = %remote_last,
                stored = %target.remote_last_anchor(),
                "anchor mismatch, forcing slow sync"
            );
            target.revert_sync_mode();
        }

        if let Some(next) = &alert.next_anchor {
            target.set_remote_next_anchor(next);
        }

        Ok(StatusCode::Success)
    }

    /// Sync arrived during initialization without any preceding alert for
    /// the pairing: the sync-without-separate-initialization shortcut.
    /// Anchors were never negotiated, so the target starts in slow mode.
    pub(crate) async fn server_setup_target_without_init(
        &mut self,
        sync: &SyncParams,
    ) -> Result<(), SessionError> {
        if self.find_target_for_sync(sync).is_some() {
            return Ok(());
        }

        debug!(
            database = %sync.target_database,
            "sync without separate initialization, setting up target"
        );

        let mut mode = self.config.sync_mode;
        mode.to_slow_sync();

        if let Some(index) =
            self.create_target(&sync.target_database, &sync.source_database, mode).await?
        {
            self.targets[index].set_target_database(&sync.source_database);
        }

        Ok(())
    }

    pub(crate) fn server_final_received(&mut self) {
        match self.state {
            // Client finished its initialization package.
            SyncState::RemoteInit => self.set_state(SyncState::LocalInit),
            // Client finished sending its modifications.
            SyncState::ReceivingItems => self.set_state(SyncState::SendingItems),
            // Client finished its mapping package.
            SyncState::ReceivingMappings => self.set_state(SyncState::Finalizing),
            _ => {}
        }
    }

    pub(crate) async fn server_message_parsed(&mut self) -> Result<SessionOutcome, SessionError> {
        match self.state {
            SyncState::LocalInit => {
                // Compose once; subsequent passes continue an init package
                // that spanned messages.
                if !self.init_acked {
                    self.compose_server_init();
                }
                let response = self.generate_response(true).await?;
                self.server_after_send();
                Ok(SessionOutcome { response, finished: false, busy: false })
            }
            SyncState::SendingItems => {
                if !self.init_acked {
                    // Collapsed initialization: acknowledge it together with
                    // our modifications.
                    self.compose_server_init();
                }
                if !self.modifications_composed {
                    for index in 0..self.targets.len() {
                        self.targets[index].discover_local_changes(Role::Server).await?;
                    }
                    self.compose_server_modifications().await?;
                    self.modifications_composed = true;
                }
                let response = self.generate_response(true).await?;
                self.server_after_send();
                Ok(SessionOutcome { response, finished: false, busy: false })
            }
            SyncState::Finalizing => {
                // Map acknowledgements go out, then the session is done.
                let response = self.generate_response(true).await?;
                self.finish_sync().await?;
                Ok(SessionOutcome { response, finished: true, busy: false })
            }
            SyncState::RemoteInit | SyncState::ReceivingItems | SyncState::ReceivingMappings => {
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

    /// Advance phase once the queued package has fully left.
    fn server_after_send(&mut self) {
        if !self.generator.packages_empty() {
            return;
        }
        match self.state {
            SyncState::LocalInit => self.set_state(SyncState::ReceivingItems),
            SyncState::SendingItems => self.set_state(SyncState::ReceivingMappings),
            _ => {}
        }
    }

    /// Queue the initialization acknowledgement: one alert per accepted
    /// target carrying the negotiated mode and our anchors, plus the
    /// device-info exchange.
    fn compose_server_init(&mut self) {
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
            Role::Server,
            &self.config,
            &self.targets,
            &self.codec,
            &mut self.generator,
        );

        self.init_acked = true;
    }

    /// Queue one local-changes package per target.
    async fn compose_server_modifications(&mut self) -> Result<(), SessionError> {
        let max_changes = self.config.max_changes_per_message;

        for index in 0..self.targets.len() {
            let items = build_outbound_items(&mut self.targets[index], Role::Server).await?;

            let target = &self.targets[index];
            debug!(
                database = %target.source_database(),
                items = items.len(),
                "queueing server modifications"
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

    /// Re-queue the package for the current phase (auth retry).
    pub(crate) async fn server_resend_package(&mut self) -> Result<(), SessionError> {
        debug!(state = ?self.state, "resending current package");
        match self.state {
            SyncState::LocalInit | SyncState::ReceivingItems => {
                self.compose_server_init();
                Ok(())
            }
            SyncState::SendingItems | SyncState::ReceivingMappings => {
                self.compose_server_modifications().await
            }
            _ => Ok(()),
        }
    }
}
