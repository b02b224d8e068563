//! Session state machine.
//!
//! One `SessionHandler` drives the phased protocol exchange for either role:
//! fragments of each inbound message are dispatched in arrival order, a Final
//! element may move the machine to the next phase, and the response message
//! is assembled from pending statuses plus the package queue. Terminal error
//! states end the session; anchors are persisted only from `finish_sync`.

mod client;
mod server;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{HeaderAuth, SessionAuthentication, StatusAuth};
use crate::command::CommandProcessor;
use crate::config::{ConfigError, SessionConfig};
use crate::device_info::RemoteDeviceInfo;
use crate::devinf::DevInfHandler;
use crate::persist::{Database, PersistError};
use crate::proto::{
    AlertCode, ModificationType, ModifiedDatabase, ProtocolVersion, Role, StatusCode,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::response::{
    status_for_command, status_for_header, ItemReference, MapReference, Package,
    ResponseGenerator,
};
use crate::results::SyncResults;
use crate::storage::buffer::{CommitStatus, StorageBuffer};
use crate::storage::conflict::ConflictResolver;
use crate::storage::{StorageError, StorageProvider};
use crate::sync_mode::SyncMode;
use crate::target::SyncTarget;
use crate::transport::TransportError;
use crate::wire::codec::{CodecError, MessageCodec};
use crate::wire::{
    AlertParams, CommandKind, CommandParams, Fragment, HeaderParams, MapParams, OutgoingMessage,
    ParsedMessage, ResultsParams, StatusParams, SyncParams,
};

/// Alert code used for the best-effort abort notification. Mirrors the
/// OPERATION_CANCELLED status code; there is no dedicated alert code for it.
const ALERT_CODE_ABORTED: u16 = 514;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    NotPrepared,
    Prepared,
    LocalInit,
    RemoteInit,
    SendingItems,
    ReceivingItems,
    SendingMappings,
    ReceivingMappings,
    Finalizing,
    SyncFinished,
    // Terminal error states
    AuthFailed,
    ConnectionError,
    InvalidSyncmlMessage,
    DatabaseFailure,
    Aborted,
    UnsupportedProtocol,
}

impl SyncState {
    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            SyncState::AuthFailed
                | SyncState::ConnectionError
                | SyncState::InvalidSyncmlMessage
                | SyncState::DatabaseFailure
                | SyncState::Aborted
                | SyncState::UnsupportedProtocol
        )
    }

    pub fn is_final(&self) -> bool {
        *self == SyncState::SyncFinished || self.is_terminal_error()
    }
}

/// Errors that end a session. Each maps to the terminal state reported in
/// the finish event.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid message: {0}")]
    Codec(#[from] CodecError),
    #[error("database failure: {0}")]
    Persist(#[from] PersistError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),
    #[error("aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    pub fn terminal_state(&self) -> SyncState {
        match self {
            SessionError::Transport(_) => SyncState::ConnectionError,
            SessionError::Codec(_) => SyncState::InvalidSyncmlMessage,
            SessionError::Persist(_) => SyncState::DatabaseFailure,
            // A storage plugin collapsing mid-session reads as a database
            // failure to the caller.
            SessionError::Storage(_) => SyncState::DatabaseFailure,
            SessionError::Config(_) => SyncState::Aborted,
            SessionError::AuthFailed(_) => SyncState::AuthFailed,
            SessionError::Protocol(_) => SyncState::InvalidSyncmlMessage,
            SessionError::UnsupportedProtocol(_) => SyncState::UnsupportedProtocol,
            SessionError::Aborted(_) => SyncState::Aborted,
        }
    }
}

/// Observable happenings, drained by the agent after each step.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SyncState),
    ItemProcessed {
        modification: ModificationType,
        database: ModifiedDatabase,
        database_uri: String,
        mime: String,
    },
    StorageAcquired {
        mime: String,
    },
    Finished {
        state: SyncState,
        error: String,
    },
}

/// Result of feeding one inbound message to the session.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Response to hand to the transport, if any.
    pub response: Option<OutgoingMessage>,
    /// The session has reached a final state; no further messages follow.
    pub finished: bool,
    /// The peer reported busy; hold the next send and keep receiving.
    pub busy: bool,
}

pub struct SessionHandler {
    config: SessionConfig,
    role: Role,
    state: SyncState,
    session_id: String,
    local_next_anchor: String,
    protocol_version: ProtocolVersion,
    database: Database,
    provider: Box<dyn StorageProvider>,
    codec: Arc<dyn MessageCodec>,
    auth: SessionAuthentication,
    processor: CommandProcessor,
    buffer: StorageBuffer,
    generator: ResponseGenerator,
    resolver: ConflictResolver,
    targets: Vec<SyncTarget>,
    item_refs: Vec<ItemReference>,
    map_refs: Vec<MapReference>,
    remote_device_info: RemoteDeviceInfo,
    devinf: DevInfHandler,
    results: SyncResults,
    events: Vec<SessionEvent>,
    local_device_name: String,
    remote_device_name: String,
    local_max_msg_size: u64,
    /// Message id of the inbound message being processed, for status refs.
    peer_msg_id: u32,
    remote_reported_busy: bool,
    resend_requested: bool,
    missing_cred_challenged: bool,
    /// Server: initialization acknowledgement (alerts, devinf) queued.
    init_acked: bool,
    /// Modifications package composed for this session.
    modifications_composed: bool,
    sync_finished: bool,
    error_description: String,
}

impl SessionHandler {
    pub async fn new(
        config: SessionConfig,
        role: Role,
        provider: Box<dyn StorageProvider>,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let database = Database::open(&config.database_file_path).await?;

        let auth = SessionAuthentication::new(
            config.auth_type,
            &config.username,
            &config.password,
            None,
            &config.username,
            &config.password,
            None,
        );

        let local_device_name = config.effective_local_device_name().to_string();
        let remote_device_name = config.remote_device_name.clone();
        let resolver = ConflictResolver::new(config.conflict_policy);
        let protocol_version = config.protocol_version;
        let processor = CommandProcessor::new(role);

        Ok(SessionHandler {
            config,
            role,
            state: SyncState::Prepared,
            session_id: String::new(),
            local_next_anchor: Utc::now().timestamp().to_string(),
            protocol_version,
            database,
            provider,
            codec,
            auth,
            processor,
            buffer: StorageBuffer::new(),
            generator: ResponseGenerator::new(),
            resolver,
            targets: Vec::new(),
            item_refs: Vec::new(),
            map_refs: Vec::new(),
            remote_device_info: RemoteDeviceInfo::default(),
            devinf: DevInfHandler::new(),
            results: SyncResults::new(),
            events: Vec::new(),
            local_device_name,
            remote_device_name,
            local_max_msg_size: DEFAULT_MAX_MESSAGE_SIZE,
            peer_msg_id: 0,
            remote_reported_busy: false,
            resend_requested: false,
            missing_cred_challenged: false,
            init_acked: false,
            modifications_composed: false,
            sync_finished: false,
            error_description: String::new(),
        })
    }

    /// Transport capabilities feed outbound size budgeting.
    pub fn set_transport_caps(&mut self, max_message_size: u64, use_wbxml: bool) {
        self.local_max_msg_size = max_message_size;
        self.generator.set_use_wbxml(use_wbxml);
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn sync_finished(&self) -> bool {
        self.sync_finished
    }

    pub fn results(&self) -> &SyncResults {
        &self.results
    }

    pub fn remote_device_info(&self) -> &RemoteDeviceInfo {
        &self.remote_device_info
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "sync state changed");
            self.state = state;
            self.events.push(SessionEvent::StateChanged(state));
        }
    }

    /// Begin the session. For the client role this composes and returns the
    /// initialization message; servers return `None` and wait for the peer.
    pub async fn initiate(&mut self) -> Result<Option<OutgoingMessage>, SessionError> {
        match self.role {
            Role::Client => {
                let message = self.client_initiate().await?;
                Ok(Some(message))
            }
            Role::Server => {
                self.set_state(SyncState::Prepared);
                Ok(None)
            }
        }
    }

    /// Abort the session. Returns a best-effort abort notification to send
    /// if the transport is still usable.
    pub fn abort(&mut self, state: SyncState, description: &str) -> Option<OutgoingMessage> {
        if self.sync_finished {
            return None;
        }

        warn!(?state, description, "aborting sync session");
        self.error_description = description.to_string();
        self.set_state(state);
        self.finish(state);

        // Best-effort notification; skip it if the session never got far
        // enough to have a header.
        if self.generator.local_header().session_id.is_empty() {
            return None;
        }

        let mut generator_message = None;
        if state == SyncState::Aborted {
            self.generator.add_package(Package::Alert(crate::response::AlertPackage {
                code: ALERT_CODE_ABORTED,
                source_database: None,
                target_database: None,
                last_anchor: None,
                next_anchor: None,
                mime: None,
            }));
            generator_message = Some(self.generator.generate_next_message().message);
        } else if self.generator.has_pending_statuses() {
            // Deliver the statuses that explain the failure (e.g. 401).
            generator_message = Some(self.generator.generate_next_message().message);
        }

        generator_message
    }

    /// Feed one parsed inbound message through the state machine.
    pub async fn process_message(
        &mut self,
        message: ParsedMessage,
    ) -> Result<SessionOutcome, SessionError> {
        if self.sync_finished {
            return Ok(SessionOutcome { response: None, finished: true, busy: false });
        }

        for fragment in message.fragments {
            if self.state.is_terminal_error() {
                break;
            }

            match fragment {
                Fragment::Header(header) => self.handle_header(header).await?,
                Fragment::Status(status) => self.handle_status(status).await?,
                Fragment::Alert(alert) => self.handle_alert(alert).await?,
                Fragment::Sync(sync) => self.handle_sync(sync).await?,
                Fragment::Map(map) => self.handle_map(map).await?,
                Fragment::Results(results) => self.handle_results(results).await?,
                Fragment::Command(command) => self.handle_command(command).await?,
                Fragment::Final => self.final_received(),
            }
        }

        self.message_parsed().await
    }

    async fn handle_header(&mut self, header: HeaderParams) -> Result<(), SessionError> {
        debug!(
            session_id = %header.session_id,
            msg_id = header.msg_id,
            source = %header.source_device,
            "processing header"
        );

        self.peer_msg_id = header.msg_id;
        self.generator.set_ignore_statuses(header.no_resp);

        // Protocol version must be one we speak.
        let Some(version) = ProtocolVersion::from_ver_proto(&header.ver_proto) else {
            self.generator.add_status(status_for_header(
                &header,
                StatusCode::UnsupportedProtocolVersion,
                None,
            ));
            self.fail_session(SessionError::UnsupportedProtocol(header.ver_proto.clone()));
            return Ok(());
        };

        if self.session_id.is_empty() {
            // Peer-initiated session: adopt its id and version.
            self.protocol_version = version;
            self.setup_session_from_header(&header);
        } else if header.session_id != self.session_id {
            self.generator
                .add_status(status_for_header(&header, StatusCode::ProcessingError, None));
            self.fail_session(SessionError::Protocol(format!(
                "session id changed mid-session: {} -> {}",
                self.session_id, header.session_id
            )));
            return Ok(());
        }

        if let Some(size) = header.max_msg_size {
            if size > 0 {
                self.generator.set_remote_max_msg_size(size);
            }
        }

        // Learn the peer's name when configuration left it open.
        if !header.source_device.is_empty() && self.role == Role::Server {
            self.remote_device_name = header.source_device.clone();
            self.generator.local_header_mut().target_device = header.source_device.clone();
        }

        let auth_result = self
            .auth
            .analyze_header(&header, &self.database, &self.local_device_name, &self.remote_device_name)
            .await?;

        match auth_result {
            HeaderAuth::Handled { status, challenge, abort } => {
                self.generator.add_status(status_for_header(&header, status, challenge));
                if abort {
                    self.fail_session(SessionError::AuthFailed(self.auth.last_error().to_string()));
                }
            }
            HeaderAuth::Abort => {
                self.fail_session(SessionError::AuthFailed(self.auth.last_error().to_string()));
            }
            HeaderAuth::NotHandled => {
                if self.auth.remote_is_authed() {
                    self.generator
                        .add_status(status_for_header(&header, StatusCode::Success, None));
                } else if self.missing_cred_challenged {
                    // Second header without credentials after a challenge.
                    self.generator
                        .add_status(status_for_header(&header, StatusCode::MissingCred, None));
                    self.fail_session(SessionError::AuthFailed(
                        "remote device did not provide credentials".to_string(),
                    ));
                } else {
                    self.missing_cred_challenged = true;
                    let challenge = self
                        .auth
                        .challenge_for_missing_cred(
                            &self.database,
                            &self.local_device_name,
                            &self.remote_device_name,
                        )
                        .await?;
                    self.generator
                        .add_status(status_for_header(&header, StatusCode::MissingCred, challenge));
                }
            }
        }

        Ok(())
    }

    async fn handle_status(&mut self, status: StatusParams) -> Result<(), SessionError> {
        let Some(code) = status.status_code() else {
            warn!(code = status.code, "status with unknown code, ignoring");
            return Ok(());
        };

        if code == StatusCode::InProgress {
            debug!("peer reported busy");
            self.remote_reported_busy = true;
            return Ok(());
        }

        if status.cmd == "SyncHdr" {
            let disposition = self
                .auth
                .analyze_header_status(&status, &self.database, &self.local_device_name, &self.remote_device_name)
                .await?;
            match disposition {
                StatusAuth::Ok | StatusAuth::NotHandled => {}
                StatusAuth::Abort => {
                    self.fail_session(SessionError::AuthFailed(self.auth.last_error().to_string()));
                }
                StatusAuth::Resend => {
                    debug!("peer challenged our credentials, resending last package");
                    self.resend_requested = true;
                }
            }
            return Ok(());
        }

        // Correlate to a sent item.
        if let Some(pos) = self
            .item_refs
            .iter()
            .position(|r| r.msg_id == status.msg_ref && r.cmd_id == status.cmd_ref)
        {
            let item_ref = self.item_refs.remove(pos);
            if code.is_success() {
                let counters = &mut self.results.target_mut(&item_ref.local_database).remote;
                match item_ref.modification {
                    ModificationType::Addition => counters.added += 1,
                    ModificationType::Modification => counters.modified += 1,
                    ModificationType::Deletion => counters.deleted += 1,
                }
                self.events.push(SessionEvent::ItemProcessed {
                    modification: item_ref.modification,
                    database: ModifiedDatabase::Remote,
                    database_uri: item_ref.remote_database.clone(),
                    mime: item_ref.mime.clone(),
                });
            } else {
                warn!(
                    key = %item_ref.key,
                    code = status.code,
                    "peer rejected item"
                );
            }
            return Ok(());
        }

        // Correlate to a sent map.
        if let Some(pos) = self
            .map_refs
            .iter()
            .position(|r| r.msg_id == status.msg_ref && r.cmd_id == status.cmd_ref)
        {
            let map_ref = self.map_refs.remove(pos);
            debug!(database = %map_ref.local_database, "mapping acknowledged");
            return Ok(());
        }

        if !code.is_success() {
            debug!(cmd = %status.cmd, code = status.code, "peer status for command");
        }

        Ok(())
    }

    async fn handle_alert(&mut self, alert: AlertParams) -> Result<(), SessionError> {
        let Some(code) = alert.alert_code() else {
            warn!(code = alert.code, "unknown alert code");
            let mut status =
                status_for_command(self.peer_msg_id, alert.cmd_id, "Alert", StatusCode::NotSupported);
            status.target_ref = alert.target_database.clone();
            status.source_ref = alert.source_database.clone();
            self.generator.add_status(status);
            return Ok(());
        };

        if code.is_sync_init() {
            let mode = SyncMode::from_alert_code(code);
            let status_code = match (mode, self.role) {
                (Some(mode), Role::Client) => self.client_sync_alert(mode, &alert).await?,
                (Some(mode), Role::Server) => self.server_sync_alert(mode, &alert).await?,
                (None, _) => StatusCode::NotSupported,
            };

            let mut status =
                status_for_command(self.peer_msg_id, alert.cmd_id, "Alert", status_code);
            status.target_ref = alert.target_database.clone();
            status.source_ref = alert.source_database.clone();
            // Acknowledge the peer's next anchor.
            status.next_anchor = alert.next_anchor.clone();
            self.generator.add_status(status);
            return Ok(());
        }

        let status_code = match code {
            // Peer wants the next message of our package; the regular send
            // logic delivers it.
            AlertCode::NextMessage => StatusCode::Success,
            // Peer confirms an unfinished large object continues next
            // message; the in-progress object stays open.
            AlertCode::NoEndOfData => StatusCode::Success,
            AlertCode::AlertSuspend | AlertCode::AlertResume => StatusCode::NotImplemented,
            AlertCode::Display => StatusCode::NotImplemented,
            AlertCode::ResultAlert => StatusCode::Success,
            _ => StatusCode::NotSupported,
        };

        let mut status = status_for_command(self.peer_msg_id, alert.cmd_id, "Alert", status_code);
        status.target_ref = alert.target_database.clone();
        status.source_ref = alert.source_database.clone();
        self.generator.add_status(status);

        Ok(())
    }

    async fn handle_sync(&mut self, sync: SyncParams) -> Result<(), SessionError> {
        let allowed = match self.role {
            Role::Client => matches!(
                self.state,
                SyncState::SendingItems | SyncState::ReceivingItems
            ),
            Role::Server => matches!(
                self.state,
                SyncState::RemoteInit | SyncState::ReceivingItems
            ),
        };

        if !allowed {
            warn!(state = ?self.state, "sync command not allowed in current state");
            self.processor.reject_sync(&sync, self.peer_msg_id, &mut self.generator, StatusCode::CommandNotAllowed);
            return Ok(());
        }

        // Sync-without-separate-initialization collapses REMOTE_INIT and
        // RECEIVING_ITEMS.
        if self.role == Role::Server && self.state == SyncState::RemoteInit {
            self.server_setup_target_without_init(&sync).await?;
        }

        let Some(index) = self.find_target_for_sync(&sync) else {
            warn!(target = %sync.target_database, "sync for unknown database");
            self.processor.reject_sync(&sync, self.peer_msg_id, &mut self.generator, StatusCode::NotFound);
            return Ok(());
        };

        self.set_state(SyncState::ReceivingItems);

        // Local changes must be known before conflict resolution; discovery
        // is a no-op if it already ran for this session.
        self.targets[index].discover_local_changes(self.role).await?;

        let outcome = self
            .processor
            .process_sync(
                &sync,
                self.peer_msg_id,
                &mut self.targets[index],
                &mut self.buffer,
                &mut self.generator,
                &self.resolver,
            )
            .await?;

        let database_uri = self.targets[index].source_database().to_string();
        for (_, commit) in &outcome.committed {
            if !commit.is_success() {
                continue;
            }
            let (modification, counts_as) = match commit.status {
                CommitStatus::Added => (ModificationType::Addition, true),
                CommitStatus::Replaced => (ModificationType::Modification, true),
                CommitStatus::Deleted => (ModificationType::Deletion, true),
                _ => (ModificationType::Modification, false),
            };
            if counts_as {
                let counters = &mut self.results.target_mut(&database_uri).local;
                match modification {
                    ModificationType::Addition => counters.added += 1,
                    ModificationType::Modification => counters.modified += 1,
                    ModificationType::Deletion => counters.deleted += 1,
                }
                self.events.push(SessionEvent::ItemProcessed {
                    modification,
                    database: ModifiedDatabase::Local,
                    database_uri: database_uri.clone(),
                    mime: self.targets[index].plugin().preferred_format().to_string(),
                });
            }
        }

        // The client answers server additions with Map commands.
        if self.role == Role::Client && !outcome.new_mappings.is_empty() {
            let target = &self.targets[index];
            let map_items: Vec<crate::wire::MapItem> = outcome
                .new_mappings
                .iter()
                .map(|m| crate::wire::MapItem {
                    target: m.remote_uid.clone(),
                    source: m.local_uid.clone(),
                })
                .collect();
            self.generator.add_package(Package::Map(crate::response::MapPackage {
                source_database: target.source_database().to_string(),
                target_database: target.target_database().to_string(),
                map_items,
            }));
        }

        Ok(())
    }

    async fn handle_map(&mut self, map: MapParams) -> Result<(), SessionError> {
        if self.role != Role::Server || self.state != SyncState::ReceivingMappings {
            warn!(state = ?self.state, "map command not allowed");
            let mut status = status_for_command(
                self.peer_msg_id,
                map.cmd_id,
                "Map",
                StatusCode::CommandNotAllowed,
            );
            status.target_ref = Some(map.target.clone());
            status.source_ref = Some(map.source.clone());
            self.generator.add_status(status);
            return Ok(());
        }

        let Some(index) = self
            .targets
            .iter()
            .position(|t| t.source_database() == map.target || t.target_database() == map.source)
        else {
            warn!(target = %map.target, "map for unknown database");
            let mut status =
                status_for_command(self.peer_msg_id, map.cmd_id, "Map", StatusCode::NotFound);
            status.target_ref = Some(map.target.clone());
            status.source_ref = Some(map.source.clone());
            self.generator.add_status(status);
            return Ok(());
        };

        self.processor
            .process_map(&map, self.peer_msg_id, &mut self.targets[index], &mut self.generator);

        Ok(())
    }

    async fn handle_results(&mut self, results: ResultsParams) -> Result<(), SessionError> {
        let handled = self.devinf.handle_results(
            &results,
            self.peer_msg_id,
            &self.codec,
            &mut self.remote_device_info,
            &mut self.generator,
        );

        if !handled {
            warn!(cmd_id = results.cmd_id, "results for something other than device info");
            self.generator.add_status(status_for_command(
                self.peer_msg_id,
                results.cmd_id,
                "Results",
                StatusCode::NotSupported,
            ));
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: CommandParams) -> Result<(), SessionError> {
        match command.kind {
            CommandKind::Get => {
                self.devinf.handle_get(
                    &command,
                    self.peer_msg_id,
                    &self.config,
                    &self.targets,
                    &self.codec,
                    &mut self.generator,
                );
            }
            CommandKind::Put => {
                self.devinf.handle_put(
                    &command,
                    self.peer_msg_id,
                    &self.codec,
                    &mut self.remote_device_info,
                    &mut self.generator,
                );
            }
            kind => {
                // Item commands outside a Sync container.
                warn!(?kind, "item command outside sync container");
                self.generator.add_status(status_for_command(
                    self.peer_msg_id,
                    command.cmd_id,
                    kind.element_name(),
                    StatusCode::CommandNotAllowed,
                ));
            }
        }
        Ok(())
    }

    fn final_received(&mut self) {
        debug!(state = ?self.state, role = ?self.role, "final received");
        match self.role {
            Role::Client => self.client_final_received(),
            Role::Server => self.server_final_received(),
        }
    }

    /// End-of-message: let the role compose the next step and build the
    /// response.
    async fn message_parsed(&mut self) -> Result<SessionOutcome, SessionError> {
        if self.state.is_terminal_error() {
            let state = self.state;
            let response = if self.generator.has_pending_statuses() {
                Some(self.generator.generate_next_message().message)
            } else {
                None
            };
            self.finish(state);
            return Ok(SessionOutcome { response, finished: true, busy: false });
        }

        if self.remote_reported_busy {
            // Hold the next send until a non-busy status arrives.
            self.remote_reported_busy = false;
            return Ok(SessionOutcome { response: None, finished: false, busy: true });
        }

        if self.resend_requested {
            self.resend_requested = false;
            self.resend_package().await?;
            let response = self.generate_response(true).await?;
            return Ok(SessionOutcome { response, finished: false, busy: false });
        }

        match self.role {
            Role::Client => self.client_message_parsed().await,
            Role::Server => self.server_message_parsed().await,
        }
    }

    /// Build a response message carrying pending statuses and package
    /// content. Refreshes header credentials when we are not authenticated
    /// yet.
    pub(crate) async fn generate_response(
        &mut self,
        allow_final: bool,
    ) -> Result<Option<OutgoingMessage>, SessionError> {
        if !self.auth.authed_to_remote() {
            let cred = self
                .auth
                .compose_credentials(&self.database, &self.local_device_name, &self.remote_device_name)
                .await?;
            self.generator.local_header_mut().cred = cred;
        } else {
            self.generator.local_header_mut().cred = None;
        }

        let generated = self.generator.generate_next_message();
        let mut message = generated.message;
        self.item_refs.extend(generated.item_refs);
        self.map_refs.extend(generated.map_refs);

        if !allow_final {
            message.final_marker = false;
        }

        Ok(Some(message))
    }

    /// Refill the package queue so the last package can be sent again (auth
    /// challenge asked for a retry with fresh credentials).
    async fn resend_package(&mut self) -> Result<(), SessionError> {
        self.generator.clear_packages();
        match self.role {
            Role::Client => self.client_resend_package().await,
            Role::Server => self.server_resend_package().await,
        }
    }

    /// Locate the target a Sync container addresses: its Target names our
    /// database, its Source the peer's.
    fn find_target_for_sync(&self, sync: &SyncParams) -> Option<usize> {
        self.targets.iter().position(|t| {
            t.source_database() == sync.target_database
                || t.target_database() == sync.source_database
        })
    }

    /// Initialize the outgoing header for a locally-initiated session.
    pub(crate) fn setup_session_local(&mut self) {
        self.session_id = generate_session_id();
        self.init_local_header();
        info!(
            session_id = %self.session_id,
            remote = %self.remote_device_name,
            "session set up locally"
        );
    }

    /// Initialize session identity from the peer's first header.
    fn setup_session_from_header(&mut self, header: &HeaderParams) {
        self.session_id = header.session_id.clone();
        if !header.source_device.is_empty() {
            self.remote_device_name = header.source_device.clone();
        }
        self.init_local_header();
        if self.role == Role::Server {
            self.set_state(SyncState::RemoteInit);
        }
        info!(
            session_id = %self.session_id,
            remote = %self.remote_device_name,
            "session set up from peer header"
        );
    }

    fn init_local_header(&mut self) {
        let header = self.generator.local_header_mut();
        header.ver_dtd = self.protocol_version.ver_dtd().to_string();
        header.ver_proto = self.protocol_version.ver_proto().to_string();
        header.session_id = self.session_id.clone();
        header.source_device = self.local_device_name.clone();
        header.target_device = self.remote_device_name.clone();
        header.max_msg_size = Some(self.local_max_msg_size);
    }

    /// Create a sync target for a configured pairing. Returns its index, or
    /// `None` when the datastore is unknown or disabled.
    pub(crate) async fn create_target(
        &mut self,
        source_uri: &str,
        target_uri: &str,
        mode: SyncMode,
    ) -> Result<Option<usize>, SessionError> {
        if !self.config.database_enabled(source_uri) {
            debug!(database = %source_uri, "datastore disabled by configuration");
            return Ok(None);
        }

        // One target per pairing within a session.
        if let Some(existing) = self.targets.iter().position(|t| t.source_database() == source_uri) {
            return Ok(Some(existing));
        }

        let Some(plugin) = self.provider.acquire_storage(source_uri).await? else {
            debug!(database = %source_uri, "no storage available");
            return Ok(None);
        };

        self.events.push(SessionEvent::StorageAcquired {
            mime: plugin.preferred_format().to_string(),
        });

        let mut change_log = crate::persist::changelog::ChangeLog::new(
            &self.remote_device_name,
            source_uri,
            mode.direction(),
        );
        change_log.load(&self.database).await?;

        let mut target = SyncTarget::new(change_log, plugin, mode, &self.local_next_anchor);
        target.set_target_database(target_uri);

        self.targets.push(target);
        Ok(Some(self.targets.len() - 1))
    }

    /// Whether the stored anchors disagree with what the peer presented.
    pub(crate) fn anchor_mismatch(target: &SyncTarget, remote_last_anchor: &str) -> bool {
        remote_last_anchor.is_empty()
            || target.remote_last_anchor().is_empty()
            || target.remote_last_anchor() != remote_last_anchor
    }

    /// Terminate with an error state derived from `error`.
    pub(crate) fn fail_session(&mut self, error: SessionError) {
        let state = error.terminal_state();
        warn!(?state, error = %error, "session failed");
        self.error_description = error.to_string();
        self.set_state(state);
    }

    /// Successful completion: persist anchors and mappings, then report.
    pub(crate) async fn finish_sync(&mut self) -> Result<(), SessionError> {
        let end_time = Utc::now();
        let database = self.database.clone();

        let mut failure = None;
        for target in &mut self.targets {
            if let Err(e) = target.save_session(&database, end_time).await {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            self.fail_session(SessionError::Persist(e));
            let state = self.state;
            self.finish(state);
            return Ok(());
        }

        self.results.set_sync_time(end_time);
        self.set_state(SyncState::SyncFinished);
        self.finish(SyncState::SyncFinished);

        info!(session_id = %self.session_id, "sync session finished");

        Ok(())
    }

    /// Emit the single terminal event.
    fn finish(&mut self, state: SyncState) {
        if self.sync_finished {
            return;
        }
        self.sync_finished = true;
        self.results.set_state(state);
        self.results.set_error_string(&self.error_description);
        self.events.push(SessionEvent::Finished {
            state,
            error: self.error_description.clone(),
        });
    }
}

fn generate_session_id() -> String {
    // Session ids are protocol-visible; keep them short but unique.
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
