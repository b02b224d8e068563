//! MD5 nonce persistence.
//!
//! One nonce per (local device, remote device) pair with overwrite semantics.
//! The stored nonce is whatever the peer supplied as NextNonce, or one we
//! generated when challenging; it is cleared once authentication succeeds.

use rand::RngCore;
use sqlx::Row;
use tracing::debug;

use crate::persist::{Database, PersistError};

/// Nonce accessor scoped to one device pair.
#[derive(Debug, Clone)]
pub struct NonceStore {
    local_device: String,
    remote_device: String,
}

impl NonceStore {
    pub fn new(local_device: &str, remote_device: &str) -> Self {
        NonceStore {
            local_device: local_device.to_string(),
            remote_device: remote_device.to_string(),
        }
    }

    /// A fresh unpredictable nonce. Not persisted until [`set_nonce`] is
    /// called with it.
    ///
    /// [`set_nonce`]: NonceStore::set_nonce
    pub fn generate_nonce() -> Vec<u8> {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes).into_bytes()
    }

    /// The stored nonce for this pair, or empty if none.
    pub async fn nonce(&self, db: &Database) -> Result<Vec<u8>, PersistError> {
        let row = sqlx::query(
            "SELECT nonce FROM nonces WHERE local_device = ?1 AND remote_device = ?2",
        )
        .bind(&self.local_device)
        .bind(&self.remote_device)
        .fetch_optional(db.pool())
        .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)).unwrap_or_default())
    }

    /// Store `nonce` for this pair, replacing any previous one.
    pub async fn set_nonce(&self, db: &Database, nonce: &[u8]) -> Result<(), PersistError> {
        let _guard = db.file_lock().await;

        let mut tx = db.pool().begin().await?;

        sqlx::query("DELETE FROM nonces WHERE local_device = ?1 AND remote_device = ?2")
            .bind(&self.local_device)
            .bind(&self.remote_device)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO nonces(local_device, remote_device, nonce) VALUES (?1, ?2, ?3)")
            .bind(&self.local_device)
            .bind(&self.remote_device)
            .bind(nonce)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            local_device = %self.local_device,
            remote_device = %self.remote_device,
            "nonce stored"
        );

        Ok(())
    }

    /// Remove the stored nonce for this pair.
    pub async fn clear_nonce(&self, db: &Database) -> Result<(), PersistError> {
        sqlx::query("DELETE FROM nonces WHERE local_device = ?1 AND remote_device = ?2")
            .bind(&self.local_device)
            .bind(&self.remote_device)
            .execute(db.pool())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        (tmp, db)
    }

    #[tokio::test]
    async fn set_and_retrieve() {
        let (_tmp, db) = test_db().await;
        let store = NonceStore::new("local", "remote");

        assert!(store.nonce(&db).await.unwrap().is_empty());

        store.set_nonce(&db, b"nonce-1").await.unwrap();
        assert_eq!(store.nonce(&db).await.unwrap(), b"nonce-1");

        // Overwrite semantics: only the latest survives.
        store.set_nonce(&db, b"nonce-2").await.unwrap();
        assert_eq!(store.nonce(&db).await.unwrap(), b"nonce-2");

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM nonces")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn pairs_are_isolated() {
        let (_tmp, db) = test_db().await;

        NonceStore::new("a", "b").set_nonce(&db, b"ab").await.unwrap();
        NonceStore::new("b", "a").set_nonce(&db, b"ba").await.unwrap();

        assert_eq!(NonceStore::new("a", "b").nonce(&db).await.unwrap(), b"ab");
        assert_eq!(NonceStore::new("b", "a").nonce(&db).await.unwrap(), b"ba");
    }

    #[tokio::test]
    async fn clear_removes_nonce() {
        let (_tmp, db) = test_db().await;
        let store = NonceStore::new("local", "remote");

        store.set_nonce(&db, b"gone soon").await.unwrap();
        store.clear_nonce(&db).await.unwrap();
        assert!(store.nonce(&db).await.unwrap().is_empty());
    }

    #[test]
    fn generated_nonces_are_unique() {
        let first = NonceStore::generate_nonce();
        let second = NonceStore::generate_nonce();
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }
}
