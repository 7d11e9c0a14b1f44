// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-backend root index.
//!
//! One `Metadata` per backend maps every shard key to its content hash, last
//! write time and per-type counts. Comparing two roots is what lets the
//! reconciler skip unchanged shards without transferring them.
//!
//! Stored under `<prefix>.metadata` as `{"metadata": {updatedAt, entityKeys}}`.
//! Created lazily (zero value) on first access; never deleted.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{self, timestamp, EntityType};
use crate::error::{Result, ShardSyncError};
use crate::shard::ShardData;
use crate::storage::Persistence;

/// Fixed id the metadata record is stored under inside its blob.
pub const METADATA_ID: &str = "metadata";

/// Blob key of the metadata record for `prefix`.
#[must_use]
pub fn metadata_key(prefix: &str) -> String {
    format!("{prefix}.{METADATA_ID}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCounts {
    pub count: usize,
    pub deleted_count: usize,
}

/// Index entry for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMeta {
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    pub hash: String,
    #[serde(default)]
    pub entities: BTreeMap<EntityType, EntityCounts>,
}

impl ShardMeta {
    /// Entry describing `shard` as written at `at`.
    pub fn describe(shard: &ShardData, at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            updated_at: at,
            hash: shard.content_hash()?,
            entities: shard.counts(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entity_keys: BTreeMap<String, ShardMeta>,
}

impl Metadata {
    /// Load the root index of `store`, zero value if none was ever written.
    pub async fn load(store: &dyn Persistence, prefix: &str) -> Result<Self> {
        let key = metadata_key(prefix);
        match store.load_data(&key).await? {
            Some(blob) => Self::from_blob(&key, blob),
            None => Ok(Self::default()),
        }
    }

    pub async fn store(&self, store: &dyn Persistence, prefix: &str) -> Result<()> {
        store.store_data(&metadata_key(prefix), &self.to_blob()?).await?;
        Ok(())
    }

    pub fn from_blob(key: &str, mut blob: Value) -> Result<Self> {
        let inner = blob
            .get_mut(METADATA_ID)
            .map(Value::take)
            .ok_or_else(|| ShardSyncError::Serialization {
                context: key.to_string(),
                message: format!("missing '{METADATA_ID}' entry"),
            })?;
        serde_json::from_value(inner).map_err(|e| ShardSyncError::serialization(key, e))
    }

    pub fn to_blob(&self) -> Result<Value> {
        let inner = serde_json::to_value(self).map_err(|e| ShardSyncError::serialization("metadata", e))?;
        let mut blob = serde_json::Map::new();
        blob.insert(METADATA_ID.to_string(), inner);
        Ok(Value::Object(blob))
    }

    /// Recompute the entry for `key` from `shard`.
    pub fn record_shard(&mut self, key: &str, shard: &ShardData, at: DateTime<Utc>) -> Result<()> {
        self.entity_keys.insert(key.to_string(), ShardMeta::describe(shard, at)?);
        Ok(())
    }

    /// Advance `updated_at` to now, strictly past its previous value.
    ///
    /// Two writes in the same millisecond must still look different to a
    /// reconciler comparing roots.
    pub fn touch(&mut self) -> DateTime<Utc> {
        self.updated_at = next_after(&[self.updated_at]);
        self.updated_at
    }

    #[must_use]
    pub fn hash_of(&self, key: &str) -> Option<&str> {
        self.entity_keys.get(key).map(|m| m.hash.as_str())
    }
}

/// Now, or one millisecond past the latest of `floors` if the clock lags.
#[must_use]
pub fn next_after(floors: &[DateTime<Utc>]) -> DateTime<Utc> {
    let now = entity::now();
    floors
        .iter()
        .map(|f| *f + Duration::milliseconds(1))
        .fold(now, std::cmp::max)
}
