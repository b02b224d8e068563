//! Top-level sync agent: owns the session loop against a transport.
//!
//! The agent wires the collaborators together and drives the
//! receive/process/send cycle until the session reaches a final state. All
//! protocol logic lives in the session; the agent only moves bytes, applies
//! the receive timeout and honors abort requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::proto::Role;
use crate::results::SyncResults;
use crate::session::{SessionEvent, SessionHandler, SessionOutcome, SyncState};
use crate::storage::StorageProvider;
use crate::transport::Transport;
use crate::wire::codec::MessageCodec;
use crate::wire::OutgoingMessage;

/// Handle for aborting a running sync from another task.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs one sync session in either role.
pub struct SyncAgent {
    config: SessionConfig,
    role: Role,
    abort: AbortHandle,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl SyncAgent {
    pub fn new(config: SessionConfig, role: Role) -> Self {
        SyncAgent {
            config,
            role,
            abort: AbortHandle {
                flag: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
            events: None,
        }
    }

    /// Handle that aborts the session from elsewhere. Level-triggered and
    /// always terminal.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Receive session events (state changes, item progress, finish) as the
    /// sync runs.
    pub fn with_event_sender(mut self, sender: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Run the session to completion and report its outcome. Never panics on
    /// protocol or transport trouble; every failure path lands in the
    /// returned results.
    pub async fn run(
        self,
        mut transport: Box<dyn Transport>,
        codec: Arc<dyn MessageCodec>,
        provider: Box<dyn StorageProvider>,
    ) -> SyncResults {
        let receive_timeout = self.config.receive_timeout_secs.map(Duration::from_secs);

        let mut session =
            match SessionHandler::new(self.config.clone(), self.role, provider, codec.clone()).await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "could not prepare session");
                    let mut results = SyncResults::new();
                    results.set_state(e.terminal_state());
                    results.set_error_string(&e.to_string());
                    return results;
                }
            };

        if let Err(e) = transport.init().await {
            session.abort(SyncState::ConnectionError, &e.to_string());
            self.drain_events(&mut session);
            return session.results().clone();
        }

        session.set_transport_caps(transport.max_message_size(), transport.uses_wbxml());

        info!(role = ?self.role, "starting sync session");

        // The client speaks first.
        match session.initiate().await {
            Ok(Some(message)) => {
                if let Err(e) = self.send(&mut transport, &codec, &message).await {
                    session.abort(SyncState::ConnectionError, &e);
                    self.drain_events(&mut session);
                    let _ = transport.close().await;
                    return session.results().clone();
                }
            }
            Ok(None) => {}
            Err(e) => {
                session.abort(e.terminal_state(), &e.to_string());
                self.drain_events(&mut session);
                let _ = transport.close().await;
                return session.results().clone();
            }
        }

        loop {
            self.drain_events(&mut session);

            if self.abort.is_aborted() && !session.sync_finished() {
                if let Some(notification) = session.abort(SyncState::Aborted, "aborted by user") {
                    let _ = self.send(&mut transport, &codec, &notification).await;
                }
                break;
            }

            let received = match self.receive(&mut transport, receive_timeout).await {
                ReceiveOutcome::Message(message) => message,
                ReceiveOutcome::Aborted => continue,
                ReceiveOutcome::Failed(description) => {
                    session.abort(SyncState::ConnectionError, &description);
                    break;
                }
            };

            let parsed = match codec.decode(&received.data, &received.content_type) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "could not parse inbound message");
                    session.abort(SyncState::InvalidSyncmlMessage, &e.to_string());
                    break;
                }
            };

            let SessionOutcome { response, finished, busy } =
                match session.process_message(parsed).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let state = e.terminal_state();
                        if let Some(notification) = session.abort(state, &e.to_string()) {
                            let _ = self.send(&mut transport, &codec, &notification).await;
                        }
                        break;
                    }
                };

            if let Some(message) = response {
                if let Err(e) = self.send(&mut transport, &codec, &message).await {
                    session.abort(SyncState::ConnectionError, &e);
                    break;
                }
            }

            if finished {
                break;
            }

            if busy {
                debug!("peer busy, holding next send");
            }
        }

        self.drain_events(&mut session);
        let _ = transport.close().await;

        session.results().clone()
    }

    async fn send(
        &self,
        transport: &mut Box<dyn Transport>,
        codec: &Arc<dyn MessageCodec>,
        message: &OutgoingMessage,
    ) -> Result<(), String> {
        let encoded = codec
            .encode(message, transport.uses_wbxml())
            .map_err(|e| e.to_string())?;
        transport
            .send(&encoded.bytes, &encoded.content_type)
            .await
            .map_err(|e| e.to_string())
    }

    async fn receive(
        &self,
        transport: &mut Box<dyn Transport>,
        timeout: Option<Duration>,
    ) -> ReceiveOutcome {
        let abort = self.abort.clone();

        let receive = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, transport.receive()).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::transport::TransportError::Timeout),
                },
                None => transport.receive().await,
            }
        };

        tokio::select! {
            result = receive => match result {
                Ok(message) => ReceiveOutcome::Message(message),
                Err(e) => ReceiveOutcome::Failed(e.to_string()),
            },
            _ = abort.notify.notified() => ReceiveOutcome::Aborted,
        }
    }

    fn drain_events(&self, session: &mut SessionHandler) {
        for event in session.drain_events() {
            debug!(?event, "session event");
            if let Some(sender) = &self.events {
                let _ = sender.send(event);
            }
        }
    }
}

enum ReceiveOutcome {
    Message(crate::transport::TransportMessage),
    Aborted,
    Failed(String),
}
