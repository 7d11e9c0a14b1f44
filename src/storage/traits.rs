use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
    },
}

/// Opaque key → blob persistence backend.
///
/// Implementations only promise per-call atomicity: a `store_data` either
/// replaces the whole blob or leaves the previous one intact. Nothing here is
/// transactional across keys, which is why the reconciler commits shard blobs
/// before the root metadata that references them.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the blob stored under `key`, `None` if absent.
    async fn load_data(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Replace the blob stored under `key`.
    async fn store_data(&self, key: &str, blob: &Value) -> Result<(), StorageError>;

    /// Remove the blob stored under `key`. Removing a missing key is not an error.
    async fn clear_data(&self, key: &str) -> Result<(), StorageError>;
}
