//! Device-info exchange (Put/Get/Results on the devinf document).
//!
//! The document format itself belongs to the codec; this module decides when
//! to send our description, answers the peer's Get with a Results, and merges
//! inbound descriptions into the session's remote-device record.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::device_info::{DataStoreInfo, DeviceInfoPayload, RemoteDeviceInfo};
use crate::proto::{ProtocolVersion, Role, StatusCode};
use crate::response::{status_for_command, DevInfPackage, Package, ResponseGenerator};
use crate::target::SyncTarget;
use crate::wire::codec::MessageCodec;
use crate::wire::{CommandParams, ResultsParams};

/// Tracks the device-info exchange for one session.
pub struct DevInfHandler {
    local_sent: bool,
    remote_received: bool,
}

impl DevInfHandler {
    pub fn new() -> Self {
        DevInfHandler { local_sent: false, remote_received: false }
    }

    pub fn local_sent(&self) -> bool {
        self.local_sent
    }

    pub fn remote_received(&self) -> bool {
        self.remote_received
    }

    /// Queue our side of the exchange during initialization: clients push
    /// their description, servers additionally ask for the peer's if it has
    /// not arrived yet.
    pub fn compose_exchange(
        &mut self,
        role: Role,
        config: &SessionConfig,
        targets: &[SyncTarget],
        codec: &Arc<dyn MessageCodec>,
        generator: &mut ResponseGenerator,
    ) {
        let version = config.protocol_version;

        if !self.local_sent {
            match codec.encode_devinf(&build_payload(config, targets, version)) {
                Ok(payload) => {
                    generator.add_package(Package::DevInf(DevInfPackage::Put {
                        path: version.devinf_path().to_string(),
                        payload,
                    }));
                    self.local_sent = true;
                }
                Err(e) => warn!(error = %e, "could not encode device info, skipping Put"),
            }
        }

        if role == Role::Server && !self.remote_received {
            generator.add_package(Package::DevInf(DevInfPackage::Get {
                path: version.devinf_path().to_string(),
            }));
        }
    }

    /// Answer a Get for the device-info document.
    pub fn handle_get(
        &mut self,
        command: &CommandParams,
        msg_id: u32,
        config: &SessionConfig,
        targets: &[SyncTarget],
        codec: &Arc<dyn MessageCodec>,
        generator: &mut ResponseGenerator,
    ) {
        let version = config.protocol_version;
        let requested = command
            .items
            .first()
            .and_then(|item| item.target.as_deref())
            .unwrap_or_default();

        if requested != version.devinf_path() {
            warn!(uri = %requested, "get for unsupported uri");
            generator.add_status(status_for_command(msg_id, command.cmd_id, "Get", StatusCode::NotFound));
            return;
        }

        match codec.encode_devinf(&build_payload(config, targets, version)) {
            Ok(payload) => {
                generator.add_package(Package::DevInf(DevInfPackage::Results {
                    msg_ref: msg_id,
                    cmd_ref: command.cmd_id,
                    path: version.devinf_path().to_string(),
                    payload,
                }));
                generator.add_status(status_for_command(msg_id, command.cmd_id, "Get", StatusCode::Success));
                self.local_sent = true;
            }
            Err(e) => {
                warn!(error = %e, "could not encode device info");
                generator.add_status(status_for_command(msg_id, command.cmd_id, "Get", StatusCode::CommandFailed));
            }
        }
    }

    /// Merge a Put carrying the peer's device info.
    pub fn handle_put(
        &mut self,
        command: &CommandParams,
        msg_id: u32,
        codec: &Arc<dyn MessageCodec>,
        remote: &mut RemoteDeviceInfo,
        generator: &mut ResponseGenerator,
    ) {
        let Some(item) = command.items.first() else {
            generator.add_status(status_for_command(msg_id, command.cmd_id, "Put", StatusCode::IncompleteCommand));
            return;
        };

        match codec.decode_devinf(&item.data) {
            Ok(payload) => {
                debug!(manufacturer = %payload.device.manufacturer, "received peer device info");
                remote.merge(payload);
                self.remote_received = true;
                generator.add_status(status_for_command(msg_id, command.cmd_id, "Put", StatusCode::Success));
            }
            Err(e) => {
                warn!(error = %e, "could not parse peer device info");
                generator.add_status(status_for_command(msg_id, command.cmd_id, "Put", StatusCode::BadRequest));
            }
        }
    }

    /// Merge a Results answering our Get.
    pub fn handle_results(
        &mut self,
        results: &ResultsParams,
        msg_id: u32,
        codec: &Arc<dyn MessageCodec>,
        remote: &mut RemoteDeviceInfo,
        generator: &mut ResponseGenerator,
    ) -> bool {
        let is_devinf = results
            .items
            .first()
            .and_then(|item| item.source.as_deref())
            .map(|uri| uri.starts_with("./devinf"))
            .unwrap_or(false)
            || results
                .meta
                .mime
                .as_deref()
                .map(|mime| mime == crate::proto::CONTTYPE_DEVINF_XML)
                .unwrap_or(false);

        if !is_devinf {
            return false;
        }

        let Some(item) = results.items.first() else {
            return false;
        };

        match codec.decode_devinf(&item.data) {
            Ok(payload) => {
                debug!(manufacturer = %payload.device.manufacturer, "received peer device info via results");
                remote.merge(payload);
                self.remote_received = true;
                generator.add_status(status_for_command(msg_id, results.cmd_id, "Results", StatusCode::Success));
            }
            Err(e) => {
                warn!(error = %e, "could not parse device info results");
                generator.add_status(status_for_command(msg_id, results.cmd_id, "Results", StatusCode::BadRequest));
            }
        }

        true
    }
}

impl Default for DevInfHandler {
    fn default() -> Self {
        DevInfHandler::new()
    }
}

/// Assemble our device-info document from the config and the session's
/// targets.
fn build_payload(
    config: &SessionConfig,
    targets: &[SyncTarget],
    version: ProtocolVersion,
) -> DeviceInfoPayload {
    let datastores = targets
        .iter()
        .map(|target| {
            let plugin = target.plugin();
            DataStoreInfo {
                source_uri: plugin.source_uri().to_string(),
                preferred_format: plugin.preferred_format().to_string(),
                supported_formats: plugin.supported_formats().to_vec(),
                max_object_size: plugin.max_object_size(),
                supported_sync_types: vec![200, 201, 202, 203, 204, 205],
                ct_caps: plugin.ct_caps(version),
            }
        })
        .collect();

    DeviceInfoPayload {
        device: config.device_info.clone(),
        datastores,
        supports_large_objects: true,
        supports_number_of_changes: true,
        utc: true,
    }
}
