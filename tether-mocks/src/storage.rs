//! In-memory storage plugin with shared, inspectable state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tether_core::proto::ProtocolVersion;
use tether_core::storage::{
    LocalChanges, PluginItemResult, PluginStatus, StorageError, StoragePlugin, StorageProvider,
    SyncItem, SyncItemKey,
};

/// Backing state of one mock datastore, shared between the plugin handed to
/// the engine and the test that inspects it afterwards.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub items: BTreeMap<SyncItemKey, SyncItem>,
    pub next_key: u32,
    /// Scripted answer for `get_modifications`.
    pub local_changes: LocalChanges,
    /// 0 means unlimited.
    pub max_object_size: u64,
    /// Remaining capacity in items; `None` means unlimited.
    pub capacity: Option<usize>,
    /// Keys deleted through the plugin, in order.
    pub deleted_keys: Vec<SyncItemKey>,
}

impl MemoryStore {
    pub fn shared() -> Arc<Mutex<MemoryStore>> {
        Arc::new(Mutex::new(MemoryStore::default()))
    }

    pub fn insert(&mut self, key: &str, data: &[u8]) {
        self.items.insert(
            key.to_string(),
            SyncItem {
                key: Some(key.to_string()),
                parent_key: None,
                mime: "text/x-vcard".to_string(),
                format: None,
                version: None,
                data: data.to_vec(),
            },
        );
    }
}

/// Storage plugin over a shared [`MemoryStore`].
pub struct MockStorage {
    source_uri: String,
    preferred_format: String,
    supported_formats: Vec<String>,
    store: Arc<Mutex<MemoryStore>>,
}

impl MockStorage {
    pub fn new(source_uri: &str, store: Arc<Mutex<MemoryStore>>) -> Self {
        MockStorage {
            source_uri: source_uri.to_string(),
            preferred_format: "text/x-vcard".to_string(),
            supported_formats: vec!["text/x-vcard".to_string(), "text/plain".to_string()],
            store,
        }
    }
}

#[async_trait]
impl StoragePlugin for MockStorage {
    fn source_uri(&self) -> &str {
        &self.source_uri
    }

    fn preferred_format(&self) -> &str {
        &self.preferred_format
    }

    fn supported_formats(&self) -> &[String] {
        &self.supported_formats
    }

    fn max_object_size(&self) -> u64 {
        self.store.lock().unwrap().max_object_size
    }

    fn ct_caps(&self, _version: ProtocolVersion) -> Option<String> {
        None
    }

    async fn get_all(&mut self) -> Result<Vec<SyncItemKey>, StorageError> {
        Ok(self.store.lock().unwrap().items.keys().cloned().collect())
    }

    async fn get_modifications(
        &mut self,
        _since: DateTime<Utc>,
    ) -> Result<LocalChanges, StorageError> {
        Ok(self.store.lock().unwrap().local_changes.clone())
    }

    async fn get_items(
        &mut self,
        keys: &[SyncItemKey],
    ) -> Result<Vec<Option<SyncItem>>, StorageError> {
        let store = self.store.lock().unwrap();
        Ok(keys.iter().map(|key| store.items.get(key).cloned()).collect())
    }

    async fn add_items(&mut self, items: &[SyncItem]) -> Result<Vec<PluginItemResult>, StorageError> {
        let mut store = self.store.lock().unwrap();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            if let Some(capacity) = store.capacity {
                if store.items.len() >= capacity {
                    results.push(PluginItemResult { key: None, status: PluginStatus::QuotaExceeded });
                    continue;
                }
            }
            if store.max_object_size > 0 && item.data.len() as u64 > store.max_object_size {
                results.push(PluginItemResult { key: None, status: PluginStatus::ItemTooBig });
                continue;
            }
            if !item.mime.is_empty() && !self.supported_formats.contains(&item.mime) {
                results.push(PluginItemResult { key: None, status: PluginStatus::UnsupportedFormat });
                continue;
            }

            store.next_key += 1;
            let key = format!("local-{}", store.next_key);
            let mut stored = item.clone();
            stored.key = Some(key.clone());
            store.items.insert(key.clone(), stored);
            results.push(PluginItemResult { key: Some(key), status: PluginStatus::Ok });
        }

        Ok(results)
    }

    async fn replace_items(
        &mut self,
        items: &[SyncItem],
    ) -> Result<Vec<PluginItemResult>, StorageError> {
        let mut store = self.store.lock().unwrap();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let Some(key) = item.key.clone() else {
                results.push(PluginItemResult { key: None, status: PluginStatus::Error });
                continue;
            };
            if store.max_object_size > 0 && item.data.len() as u64 > store.max_object_size {
                results.push(PluginItemResult { key: Some(key), status: PluginStatus::ItemTooBig });
                continue;
            }

            // A replace for an unknown key creates the item under that key,
            // the common behavior of address-book style datastores.
            store.items.insert(key.clone(), item.clone());
            results.push(PluginItemResult { key: Some(key), status: PluginStatus::Ok });
        }

        Ok(results)
    }

    async fn delete_items(&mut self, keys: &[SyncItemKey]) -> Result<Vec<PluginStatus>, StorageError> {
        let mut store = self.store.lock().unwrap();
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            if store.items.remove(key).is_some() {
                store.deleted_keys.push(key.clone());
                results.push(PluginStatus::Ok);
            } else {
                results.push(PluginStatus::NotFound);
            }
        }

        Ok(results)
    }
}

/// Provider mapping datastore URIs to shared stores.
#[derive(Default)]
pub struct MockStorageProvider {
    stores: Vec<(String, Arc<Mutex<MemoryStore>>)>,
}

impl MockStorageProvider {
    pub fn new() -> Self {
        MockStorageProvider::default()
    }

    /// Register a datastore; returns the shared store for inspection.
    pub fn add_store(&mut self, uri: &str) -> Arc<Mutex<MemoryStore>> {
        let store = MemoryStore::shared();
        self.stores.push((uri.to_string(), store.clone()));
        store
    }

    pub fn add_shared_store(&mut self, uri: &str, store: Arc<Mutex<MemoryStore>>) {
        self.stores.push((uri.to_string(), store));
    }
}

#[async_trait]
impl StorageProvider for MockStorageProvider {
    async fn acquire_storage(
        &mut self,
        uri: &str,
    ) -> Result<Option<Box<dyn StoragePlugin>>, StorageError> {
        Ok(self
            .stores
            .iter()
            .find(|(stored_uri, _)| stored_uri == uri)
            .map(|(_, store)| Box::new(MockStorage::new(uri, store.clone())) as Box<dyn StoragePlugin>))
    }
}
