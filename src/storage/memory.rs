use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use super::traits::{Persistence, StorageError};

/// DashMap-backed persistence, used as the primary store and in tests.
pub struct InMemoryStore {
    data: DashMap<String, Value>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current blob count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sorted list of stored keys
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Clear all blobs
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn load_data(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn store_data(&self, key: &str, blob: &Value) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), blob.clone());
        Ok(())
    }

    async fn clear_data(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}
