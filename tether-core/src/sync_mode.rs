//! Sync mode as the (direction, initiator, type) triple.
//!
//! The wire protocol collapses the triple into alert codes 200..210; both
//! conversions live here. A mode constructed from an out-of-range code is
//! invalid and must be rejected with NOT_SUPPORTED by the caller.

use serde::{Deserialize, Serialize};

use crate::proto::AlertCode;

/// Direction of data flow for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    TwoWay,
    FromClient,
    FromServer,
}

impl SyncDirection {
    /// Stable integer used in the persistence composite key.
    pub fn as_db_code(&self) -> i64 {
        match self {
            SyncDirection::TwoWay => 0,
            SyncDirection::FromClient => 1,
            SyncDirection::FromServer => 2,
        }
    }
}

/// Which side initiated the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncInitiator {
    Client,
    Server,
}

/// How much data is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Incremental: only changes since the last anchors.
    Fast,
    /// Full two-way exchange of all items.
    Slow,
    /// One-sided replacement of the receiver's data set.
    Refresh,
}

/// The negotiated sync mode of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMode {
    direction: SyncDirection,
    initiator: SyncInitiator,
    sync_type: SyncType,
}

impl SyncMode {
    pub fn new(direction: SyncDirection, initiator: SyncInitiator, sync_type: SyncType) -> Self {
        SyncMode { direction, initiator, sync_type }
    }

    /// Decode an alert code into a mode. Returns `None` for codes outside
    /// the sync-initialization range.
    pub fn from_alert_code(code: AlertCode) -> Option<Self> {
        use AlertCode::*;
        let (direction, initiator, sync_type) = match code {
            TwoWaySync => (SyncDirection::TwoWay, SyncInitiator::Client, SyncType::Fast),
            SlowSync => (SyncDirection::TwoWay, SyncInitiator::Client, SyncType::Slow),
            OneWayFromClientSync => (SyncDirection::FromClient, SyncInitiator::Client, SyncType::Fast),
            RefreshFromClientSync => (SyncDirection::FromClient, SyncInitiator::Client, SyncType::Refresh),
            OneWayFromServerSync => (SyncDirection::FromServer, SyncInitiator::Client, SyncType::Fast),
            RefreshFromServerSync => (SyncDirection::FromServer, SyncInitiator::Client, SyncType::Refresh),
            TwoWayByServer => (SyncDirection::TwoWay, SyncInitiator::Server, SyncType::Fast),
            OneWayFromClientByServer => (SyncDirection::FromClient, SyncInitiator::Server, SyncType::Fast),
            RefreshFromClientByServer => (SyncDirection::FromClient, SyncInitiator::Server, SyncType::Refresh),
            OneWayFromServerByServer => (SyncDirection::FromServer, SyncInitiator::Server, SyncType::Fast),
            RefreshFromServerByServer => (SyncDirection::FromServer, SyncInitiator::Server, SyncType::Refresh),
            _ => return None,
        };
        Some(SyncMode { direction, initiator, sync_type })
    }

    /// Encode the mode back into its alert code.
    ///
    /// A slow sync is only expressible for client-initiated two-way mode; the
    /// remaining combinations fall back to their fast/refresh codes, matching
    /// the wire protocol's table.
    pub fn to_alert_code(&self) -> AlertCode {
        use AlertCode::*;
        match (self.direction, self.initiator) {
            (SyncDirection::TwoWay, SyncInitiator::Client) => match self.sync_type {
                SyncType::Slow => SlowSync,
                _ => TwoWaySync,
            },
            (SyncDirection::TwoWay, SyncInitiator::Server) => TwoWayByServer,
            (SyncDirection::FromClient, SyncInitiator::Client) => match self.sync_type {
                SyncType::Refresh => RefreshFromClientSync,
                _ => OneWayFromClientSync,
            },
            (SyncDirection::FromClient, SyncInitiator::Server) => match self.sync_type {
                SyncType::Refresh => RefreshFromClientByServer,
                _ => OneWayFromClientByServer,
            },
            (SyncDirection::FromServer, SyncInitiator::Client) => match self.sync_type {
                SyncType::Refresh => RefreshFromServerSync,
                _ => OneWayFromServerSync,
            },
            (SyncDirection::FromServer, SyncInitiator::Server) => match self.sync_type {
                SyncType::Refresh => RefreshFromServerByServer,
                _ => OneWayFromServerByServer,
            },
        }
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    pub fn initiator(&self) -> SyncInitiator {
        self.initiator
    }

    pub fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    /// Downgrade a fast sync to slow. No-op for refresh.
    pub fn to_slow_sync(&mut self) {
        if self.sync_type == SyncType::Fast {
            self.sync_type = SyncType::Slow;
        }
    }

    pub fn set_refresh(&mut self) {
        self.sync_type = SyncType::Refresh;
    }

    pub fn to_client_initiated(&mut self) {
        self.initiator = SyncInitiator::Client;
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::new(SyncDirection::TwoWay, SyncInitiator::Client, SyncType::Fast)
    }
}
