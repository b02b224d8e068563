//! Session configuration.
//!
//! Everything a session needs that is not a live collaborator (transport,
//! codec, storage provider): identities, protocol version, sync mode,
//! credentials, conflict policy and the datastore pairing table. Loadable
//! from YAML; unknown fields are ignored and absent optional fields default.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthType;
use crate::device_info::DeviceInfo;
use crate::proto::{ProtocolVersion, DEFAULT_MAX_CHANGES_PER_MESSAGE};
use crate::storage::conflict::ConflictPolicy;
use crate::sync_mode::SyncMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One local-to-remote datastore pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePair {
    /// Local datastore URI, e.g. `./contacts`.
    pub source: String,
    /// Remote datastore URI as the peer names it.
    pub target: String,
}

fn default_protocol_version() -> ProtocolVersion {
    ProtocolVersion::V12
}

fn default_auth_type() -> AuthType {
    AuthType::None
}

fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::PreferLocal
}

fn default_max_changes() -> u32 {
    DEFAULT_MAX_CHANGES_PER_MESSAGE
}

/// Configuration for one sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the local device; defaults to the device-info device id when
    /// empty.
    #[serde(default)]
    pub local_device_name: String,
    pub remote_device_name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_max_changes")]
    pub max_changes_per_message: u32,
    /// Path of the persistence database (anchors, UID maps, nonces).
    pub database_file_path: String,
    /// Datastore pairings to sync.
    #[serde(default)]
    pub database_pairs: Vec<DatabasePair>,
    /// Local datastores excluded from this session even if alerted.
    #[serde(default)]
    pub disabled_databases: Vec<String>,
    /// Feature toggles outside the protocol proper (e.g. `SAN_MAPPINGS`,
    /// `EMI_TAGS`).
    #[serde(default)]
    pub extensions: HashMap<String, String>,
    /// Timeout for awaiting a transport response; `None` leaves it to the
    /// transport.
    #[serde(default)]
    pub receive_timeout_secs: Option<u64>,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

impl SessionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// The device name used in outgoing headers.
    pub fn effective_local_device_name(&self) -> &str {
        if self.local_device_name.is_empty() {
            &self.device_info.device_id
        } else {
            &self.local_device_name
        }
    }

    /// Whether `uri` names a datastore this session may touch.
    pub fn database_enabled(&self, uri: &str) -> bool {
        !self.disabled_databases.iter().any(|db| db == uri)
    }

    /// Find the pairing whose local side is `source`.
    pub fn pair_for_source(&self, source: &str) -> Option<&DatabasePair> {
        self.database_pairs.iter().find(|p| p.source == source)
    }

    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_device_name.is_empty() {
            return Err(ConfigError::Invalid("remote device name is required".into()));
        }
        if self.effective_local_device_name().is_empty() {
            return Err(ConfigError::Invalid(
                "local device name or device id is required".into(),
            ));
        }
        if self.database_file_path.is_empty() {
            return Err(ConfigError::Invalid("database file path is required".into()));
        }
        if self.auth_type != AuthType::None && self.username.is_empty() {
            return Err(ConfigError::Invalid(
                "username is required when authentication is enabled".into(),
            ));
        }
        if self.max_changes_per_message == 0 {
            return Err(ConfigError::Invalid(
                "max changes per message must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_mode::{SyncDirection, SyncType};

    fn minimal_yaml() -> &'static str {
        "remote_device_name: pc-suite\n\
         local_device_name: IMEI:1234\n\
         database_file_path: /tmp/sync.db\n\
         database_pairs:\n\
         - {source: ./contacts, target: ./contacts}\n"
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = SessionConfig::from_yaml_str(minimal_yaml()).unwrap();
        assert_eq!(config.protocol_version, ProtocolVersion::V12);
        assert_eq!(config.auth_type, AuthType::None);
        assert_eq!(config.conflict_policy, ConflictPolicy::PreferLocal);
        assert_eq!(config.max_changes_per_message, 22);
        assert_eq!(config.sync_mode.direction(), SyncDirection::TwoWay);
        assert_eq!(config.sync_mode.sync_type(), SyncType::Fast);
        assert!(config.database_enabled("./contacts"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let yaml = format!("{}some_future_option: true\n", minimal_yaml());
        SessionConfig::from_yaml_str(&yaml).unwrap();
    }

    #[test]
    fn auth_requires_username() {
        let yaml = format!("{}auth_type: md5\n", minimal_yaml());
        let err = SessionConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let yaml = format!("{}auth_type: md5\nusername: u\npassword: p\n", minimal_yaml());
        SessionConfig::from_yaml_str(&yaml).unwrap();
    }

    #[test]
    fn disabled_databases_are_rejected() {
        let yaml = format!("{}disabled_databases: ['./contacts']\n", minimal_yaml());
        let config = SessionConfig::from_yaml_str(&yaml).unwrap();
        assert!(!config.database_enabled("./contacts"));
        assert!(config.database_enabled("./calendar"));
    }

    #[test]
    fn local_name_falls_back_to_device_id() {
        let yaml = "remote_device_name: pc-suite\n\
                    database_file_path: /tmp/sync.db\n\
                    device_info:\n\
                    \x20 device_id: IMEI:5678\n";
        let config = SessionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.effective_local_device_name(), "IMEI:5678");
    }

    #[test]
    fn extensions_round_trip() {
        let yaml = format!("{}extensions:\n  EMI_TAGS: 'x-vendor'\n", minimal_yaml());
        let config = SessionConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.extension("EMI_TAGS"), Some("x-vendor"));
        assert_eq!(config.extension("MISSING"), None);
    }
}
