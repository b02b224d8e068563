//! Anchor and UID-map persistence for one (remote device, datastore,
//! direction) pairing.
//!
//! A save rewrites the pairing's rows: the prior change-log row and every
//! prior mapping are deleted, then the current state is inserted, all inside
//! one transaction under the per-file lock. A failed save leaves the previous
//! anchors untouched.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use tracing::{debug, warn};

use crate::persist::{Database, PersistError};
use crate::sync_mode::SyncDirection;

/// One local-to-remote key association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidMapping {
    pub local_uid: String,
    pub remote_uid: String,
}

/// Persistent sync state for one pairing.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    remote_device: String,
    source_db_uri: String,
    direction: SyncDirection,
    last_local_anchor: String,
    last_remote_anchor: String,
    last_sync_time: Option<DateTime<Utc>>,
    maps: Vec<UidMapping>,
}

impl ChangeLog {
    pub fn new(remote_device: &str, source_db_uri: &str, direction: SyncDirection) -> Self {
        ChangeLog {
            remote_device: remote_device.to_string(),
            source_db_uri: source_db_uri.to_string(),
            direction,
            last_local_anchor: String::new(),
            last_remote_anchor: String::new(),
            last_sync_time: None,
            maps: Vec::new(),
        }
    }

    pub fn last_local_anchor(&self) -> &str {
        &self.last_local_anchor
    }

    pub fn set_last_local_anchor(&mut self, anchor: &str) {
        self.last_local_anchor = anchor.to_string();
    }

    pub fn last_remote_anchor(&self) -> &str {
        &self.last_remote_anchor
    }

    pub fn set_last_remote_anchor(&mut self, anchor: &str) {
        self.last_remote_anchor = anchor.to_string();
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    pub fn set_last_sync_time(&mut self, time: DateTime<Utc>) {
        self.last_sync_time = Some(time);
    }

    pub fn maps(&self) -> &[UidMapping] {
        &self.maps
    }

    pub fn set_maps(&mut self, maps: Vec<UidMapping>) {
        self.maps = maps;
    }

    /// Load anchors and mappings for this pairing. Returns `true` when a
    /// previous session had saved state.
    pub async fn load(&mut self, db: &Database) -> Result<bool, PersistError> {
        debug!(
            remote_device = %self.remote_device,
            source_db_uri = %self.source_db_uri,
            direction = self.direction.as_db_code(),
            "loading change log"
        );

        let row = sqlx::query(
            "SELECT local_sync_anchor, remote_sync_anchor, last_sync_time FROM change_logs \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .fetch_optional(db.pool())
        .await?;

        let found = match row {
            Some(row) => {
                self.last_local_anchor = row.get::<String, _>(0);
                self.last_remote_anchor = row.get::<String, _>(1);
                let seconds = row.get::<Option<i64>, _>(2);
                self.last_sync_time = seconds.and_then(|s| Utc.timestamp_opt(s, 0).single());

                debug!(
                    local_anchor = %self.last_local_anchor,
                    remote_anchor = %self.last_remote_anchor,
                    "found existing anchors"
                );
                true
            }
            None => {
                debug!("no existing change log entry, starting fresh");
                false
            }
        };

        let rows = sqlx::query(
            "SELECT local_id, remote_id FROM id_maps \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .fetch_all(db.pool())
        .await?;

        self.maps = rows
            .into_iter()
            .map(|row| UidMapping {
                local_uid: row.get::<String, _>(0),
                remote_uid: row.get::<String, _>(1),
            })
            .collect();

        Ok(found)
    }

    /// Save this pairing's state, replacing whatever was stored before.
    pub async fn save(&self, db: &Database) -> Result<(), PersistError> {
        let _guard = db.file_lock().await;

        debug!(
            remote_device = %self.remote_device,
            source_db_uri = %self.source_db_uri,
            direction = self.direction.as_db_code(),
            mappings = self.maps.len(),
            "saving change log"
        );

        let mut tx = db.pool().begin().await?;

        sqlx::query(
            "DELETE FROM change_logs \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO change_logs(remote_device, source_db_uri, sync_direction, \
             local_sync_anchor, remote_sync_anchor, last_sync_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .bind(&self.last_local_anchor)
        .bind(&self.last_remote_anchor)
        .bind(self.last_sync_time.map(|t| t.timestamp()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM id_maps \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .execute(&mut *tx)
        .await?;

        for mapping in &self.maps {
            sqlx::query(
                "INSERT INTO id_maps(remote_device, source_db_uri, sync_direction, \
                 local_id, remote_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&self.remote_device)
            .bind(&self.source_db_uri)
            .bind(self.direction.as_db_code())
            .bind(&mapping.local_uid)
            .bind(&mapping.remote_uid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Remove all stored state for this pairing.
    pub async fn remove(&self, db: &Database) -> Result<(), PersistError> {
        let _guard = db.file_lock().await;

        debug!(
            remote_device = %self.remote_device,
            source_db_uri = %self.source_db_uri,
            "removing change log"
        );

        let mut tx = db.pool().begin().await?;

        sqlx::query(
            "DELETE FROM change_logs \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM id_maps \
             WHERE remote_device = ?1 AND source_db_uri = ?2 AND sync_direction = ?3",
        )
        .bind(&self.remote_device)
        .bind(&self.source_db_uri)
        .bind(self.direction.as_db_code())
        .execute(&mut *tx)
        .await?;

        if let Err(e) = tx.commit().await {
            warn!(error = %e, "could not remove change log");
            return Err(e.into());
        }

        Ok(())
    }
}
