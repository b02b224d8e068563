//! Final outcome of a sync session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::session::SyncState;

/// Item counters for one database within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemCounts {
    pub added: u32,
    pub modified: u32,
    pub deleted: u32,
}

impl ItemCounts {
    pub fn total(&self) -> u32 {
        self.added + self.modified + self.deleted
    }
}

/// Per-target outcome: what changed locally and what the peer applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetResults {
    /// Items committed to the local database.
    pub local: ItemCounts,
    /// Items the peer acknowledged applying.
    pub remote: ItemCounts,
}

/// Outcome of a finished (or failed) session.
#[derive(Debug, Clone)]
pub struct SyncResults {
    state: SyncState,
    error_string: String,
    sync_time: DateTime<Utc>,
    targets: BTreeMap<String, TargetResults>,
}

impl SyncResults {
    pub fn new() -> Self {
        SyncResults {
            state: SyncState::NotPrepared,
            error_string: String::new(),
            sync_time: Utc::now(),
            targets: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn set_state(&mut self, state: SyncState) {
        self.state = state;
    }

    pub fn is_success(&self) -> bool {
        self.state == SyncState::SyncFinished
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn set_error_string(&mut self, error: &str) {
        self.error_string = error.to_string();
    }

    pub fn sync_time(&self) -> DateTime<Utc> {
        self.sync_time
    }

    pub fn set_sync_time(&mut self, time: DateTime<Utc>) {
        self.sync_time = time;
    }

    pub fn targets(&self) -> &BTreeMap<String, TargetResults> {
        &self.targets
    }

    pub fn target_mut(&mut self, database: &str) -> &mut TargetResults {
        self.targets.entry(database.to_string()).or_default()
    }
}

impl Default for SyncResults {
    fn default() -> Self {
        SyncResults::new()
    }
}
