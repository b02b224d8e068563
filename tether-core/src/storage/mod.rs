//! Storage plugin seam and the item types moved across it.
//!
//! A storage plugin fronts one local datastore (contacts, calendar,
//! bookmarks). The engine batches modifications through it and asks it to
//! discover local changes; it never caches plugin state across sessions.

pub mod buffer;
pub mod conflict;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::proto::ProtocolVersion;

/// Key of an item in a local datastore.
pub type SyncItemKey = String;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage plugin error: {0}")]
    Plugin(String),
    #[error("no storage available for {0}")]
    NoStorage(String),
}

/// One item moving through the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncItem {
    /// Local key; `None` until the plugin allocates one on add.
    pub key: Option<SyncItemKey>,
    pub parent_key: Option<SyncItemKey>,
    pub mime: String,
    pub format: Option<String>,
    pub version: Option<String>,
    pub data: Vec<u8>,
}

/// Per-item status reported by a plugin batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Ok,
    /// The item already exists with identical content.
    Duplicate,
    NotFound,
    UnsupportedFormat,
    ItemTooBig,
    QuotaExceeded,
    Error,
}

/// Result of one item in a batch add/replace.
#[derive(Debug, Clone)]
pub struct PluginItemResult {
    /// Key of the item; for adds, the newly allocated key on success.
    pub key: Option<SyncItemKey>,
    pub status: PluginStatus,
}

/// Local modifications discovered by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalChanges {
    pub added: Vec<SyncItemKey>,
    pub modified: Vec<SyncItemKey>,
    pub removed: Vec<SyncItemKey>,
}

impl LocalChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn contains(&self, key: &SyncItemKey) -> bool {
        self.added.contains(key) || self.modified.contains(key) || self.removed.contains(key)
    }

    /// Drop a key from all three change sets. Returns whether it was present.
    pub fn remove(&mut self, key: &SyncItemKey) -> bool {
        let before = self.total();
        self.added.retain(|k| k != key);
        self.modified.retain(|k| k != key);
        self.removed.retain(|k| k != key);
        before != self.total()
    }
}

/// Adapter over one local datastore.
#[async_trait]
pub trait StoragePlugin: Send {
    /// URI of the datastore, e.g. `./contacts`.
    fn source_uri(&self) -> &str;

    /// MIME type the datastore prefers to receive.
    fn preferred_format(&self) -> &str;

    /// All MIME types the datastore accepts.
    fn supported_formats(&self) -> &[String];

    /// Largest single item the datastore accepts; 0 means no limit.
    fn max_object_size(&self) -> u64;

    /// CTCap description for the device-info document of `version`.
    fn ct_caps(&self, version: ProtocolVersion) -> Option<String>;

    /// Keys of every item in the datastore.
    async fn get_all(&mut self) -> Result<Vec<SyncItemKey>, StorageError>;

    /// Changes since `since`, split into added/modified/removed.
    async fn get_modifications(&mut self, since: DateTime<Utc>) -> Result<LocalChanges, StorageError>;

    /// Fetch full items for composing outbound modifications. Missing keys
    /// yield `None` in the corresponding slot.
    async fn get_items(&mut self, keys: &[SyncItemKey]) -> Result<Vec<Option<SyncItem>>, StorageError>;

    /// Batch add. One result per input item, in order.
    async fn add_items(&mut self, items: &[SyncItem]) -> Result<Vec<PluginItemResult>, StorageError>;

    /// Batch replace keyed by each item's `key`.
    async fn replace_items(&mut self, items: &[SyncItem]) -> Result<Vec<PluginItemResult>, StorageError>;

    /// Batch delete. One status per key, in order.
    async fn delete_items(&mut self, keys: &[SyncItemKey]) -> Result<Vec<PluginStatus>, StorageError>;
}

/// Factory the application supplies for acquiring storage plugins.
#[async_trait]
pub trait StorageProvider: Send {
    /// Acquire the plugin backing `uri`, or `None` if the datastore is
    /// unknown or disabled.
    async fn acquire_storage(&mut self, uri: &str) -> Result<Option<Box<dyn StoragePlugin>>, StorageError>;
}
