//! Local and remote device descriptions.
//!
//! `DeviceInfo` is what we advertise in the device-info exchange.
//! `RemoteDeviceInfo` collects what the peer told us about itself; it is a
//! per-session value carried inside the session so that concurrent sessions
//! never share mutable device state.

use serde::{Deserialize, Serialize};

use crate::proto::AlertCode;

/// Description of the local device, advertised via Put/Results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub hardware_version: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

fn default_device_type() -> String {
    "phone".to_string()
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            device_id: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            firmware_version: String::new(),
            software_version: String::new(),
            hardware_version: String::new(),
            device_type: default_device_type(),
        }
    }
}

/// Capabilities of one datastore in a device-info document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreInfo {
    pub source_uri: String,
    #[serde(default)]
    pub preferred_format: String,
    #[serde(default)]
    pub supported_formats: Vec<String>,
    /// 0 means no limit was advertised.
    #[serde(default)]
    pub max_object_size: u64,
    /// Sync-initialization alert codes the datastore supports.
    #[serde(default)]
    pub supported_sync_types: Vec<u16>,
    /// Raw CTCap description, passed through untouched.
    #[serde(default)]
    pub ct_caps: Option<String>,
}

/// The device-info document exchanged via Put/Get/Results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoPayload {
    pub device: DeviceInfo,
    #[serde(default)]
    pub datastores: Vec<DataStoreInfo>,
    #[serde(default)]
    pub supports_large_objects: bool,
    #[serde(default)]
    pub supports_number_of_changes: bool,
    #[serde(default)]
    pub utc: bool,
}

/// What we know about the peer device in this session.
#[derive(Debug, Clone, Default)]
pub struct RemoteDeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub software_version: String,
    pub supports_large_objects: bool,
    pub supports_number_of_changes: bool,
    pub datastores: Vec<DataStoreInfo>,
    /// Set once a Put or Results carrying device info has been merged.
    pub received: bool,
}

impl RemoteDeviceInfo {
    /// Merge a device-info document received from the peer.
    pub fn merge(&mut self, payload: DeviceInfoPayload) {
        self.manufacturer = payload.device.manufacturer;
        self.model = payload.device.model;
        self.software_version = payload.device.software_version;
        self.supports_large_objects = payload.supports_large_objects;
        self.supports_number_of_changes = payload.supports_number_of_changes;
        self.datastores = payload.datastores;
        self.received = true;
    }

    /// Whether the peer advertised support for a sync type on the given
    /// datastore. Unknown datastores are permissive: the peer may simply not
    /// have sent device info yet.
    pub fn supports_sync_type(&self, source_uri: &str, code: AlertCode) -> bool {
        match self.datastores.iter().find(|ds| ds.source_uri == source_uri) {
            Some(ds) if !ds.supported_sync_types.is_empty() => {
                ds.supported_sync_types.contains(&code.as_u16())
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_populates_fields() {
        let mut remote = RemoteDeviceInfo::default();
        assert!(!remote.received);

        remote.merge(DeviceInfoPayload {
            device: DeviceInfo {
                device_id: "IMEI:1234".into(),
                manufacturer: "Acme".into(),
                model: "Handset".into(),
                software_version: "2.1".into(),
                ..Default::default()
            },
            datastores: vec![DataStoreInfo {
                source_uri: "./contacts".into(),
                supported_sync_types: vec![200, 201],
                ..Default::default()
            }],
            supports_large_objects: true,
            supports_number_of_changes: false,
            utc: true,
        });

        assert!(remote.received);
        assert_eq!(remote.manufacturer, "Acme");
        assert!(remote.supports_large_objects);
        assert!(remote.supports_sync_type("./contacts", AlertCode::TwoWaySync));
        assert!(!remote.supports_sync_type("./contacts", AlertCode::RefreshFromServerSync));
        // Unknown datastore stays permissive.
        assert!(remote.supports_sync_type("./notes", AlertCode::RefreshFromServerSync));
    }
}
