//! In-memory storage adapter for tests and same-process sessions.
//!
//! A `BTreeMap` keyed by path vectors; range operations are prefix scans.
//! Several subsystems may share one adapter through `Arc` to model two
//! peers on the same disk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{StorageAdapter, StorageError, StorageKey};

/// A storage adapter holding everything in process memory.
#[derive(Default)]
pub struct InMemoryStorageAdapter {
    entries: RwLock<BTreeMap<StorageKey, Vec<u8>>>,
}

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All keys under a prefix, for test assertions.
    pub async fn keys_under(&self, prefix: &StorageKey) -> Vec<StorageKey> {
        self.entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.clone(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn load_range(
        &self,
        prefix: &StorageKey,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
