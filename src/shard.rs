// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard payload: the unit of storage I/O and sync.
//!
//! # Blob layout
//!
//! ```text
//! {
//!   "transaction": { "2024.03.ab12cd34": { "id": ..., "version": 2, ... } },
//!   "deleted":     { "transaction": { "2024.03.ffee0011": "2024-03-20T10:00:00.000Z" } }
//! }
//! ```
//!
//! Within one snapshot an id is either active or tombstoned, never both.
//! Tombstones are never compacted.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entity::{timestamp, Entity, EntityType};
use crate::error::{Result, ShardSyncError};
use crate::metadata::EntityCounts;
use crate::storage::Persistence;

/// Deletion timestamp retained in place of a removed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tombstone {
    #[serde(with = "timestamp")]
    pub deleted_at: DateTime<Utc>,
}

/// What one side of a merge holds for an id.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Active(Entity),
    Deleted(DateTime<Utc>),
}

/// Deserialized shard blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardData {
    #[serde(flatten)]
    pub entities: BTreeMap<EntityType, BTreeMap<String, Entity>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deleted: BTreeMap<EntityType, BTreeMap<String, Tombstone>>,
}

impl ShardData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a blob read from `key`.
    pub fn from_blob(key: &str, blob: Value) -> Result<Self> {
        serde_json::from_value(blob).map_err(|e| ShardSyncError::serialization(key, e))
    }

    /// Encode to the canonical blob (empty type maps dropped).
    pub fn to_blob(&self) -> Result<Value> {
        let mut normalized = self.clone();
        normalized.entities.retain(|_, m| !m.is_empty());
        normalized.deleted.retain(|_, m| !m.is_empty());
        serde_json::to_value(&normalized).map_err(|e| ShardSyncError::serialization("shard", e))
    }

    /// Hex SHA-256 over the key-sorted serialization.
    ///
    /// `to_blob` goes through `serde_json::Value`, whose objects are sorted
    /// maps, so nested entity fields are canonical too.
    pub fn content_hash(&self) -> Result<String> {
        let blob = self.to_blob()?;
        hash_blob(&blob)
    }

    /// Load and decode `key` from `store`.
    pub async fn load(store: &dyn Persistence, key: &str) -> Result<Option<Self>> {
        match store.load_data(key).await? {
            Some(blob) => Ok(Some(Self::from_blob(key, blob)?)),
            None => Ok(None),
        }
    }

    /// Encode and write to `key`.
    pub async fn store(&self, store: &dyn Persistence, key: &str) -> Result<()> {
        store.store_data(key, &self.to_blob()?).await?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.entities.get(&entity_type)?.get(id)
    }

    #[must_use]
    pub fn tombstone(&self, entity_type: EntityType, id: &str) -> Option<DateTime<Utc>> {
        self.deleted.get(&entity_type)?.get(id).map(|t| t.deleted_at)
    }

    /// Active entities of one type, in id order.
    pub fn entities_of(&self, entity_type: EntityType) -> impl Iterator<Item = &Entity> {
        self.entities.get(&entity_type).into_iter().flat_map(|m| m.values())
    }

    /// Insert or replace an active entity, clearing any tombstone for its id.
    pub fn upsert(&mut self, entity_type: EntityType, entity: Entity) {
        if let Some(tombs) = self.deleted.get_mut(&entity_type) {
            tombs.remove(&entity.id);
        }
        self.entities
            .entry(entity_type)
            .or_default()
            .insert(entity.id.clone(), entity);
    }

    /// Tombstone `id`, returning the active entity it replaced.
    pub fn delete(&mut self, entity_type: EntityType, id: &str, at: DateTime<Utc>) -> Option<Entity> {
        let removed = self.entities.get_mut(&entity_type).and_then(|m| m.remove(id));
        self.deleted
            .entry(entity_type)
            .or_default()
            .insert(id.to_string(), Tombstone { deleted_at: at });
        removed
    }

    /// Active record or tombstone for `id`.
    #[must_use]
    pub fn record(&self, entity_type: EntityType, id: &str) -> Option<Record> {
        if let Some(entity) = self.get(entity_type, id) {
            return Some(Record::Active(entity.clone()));
        }
        self.tombstone(entity_type, id).map(Record::Deleted)
    }

    /// Make `record` the value held for `id`.
    pub fn apply(&mut self, entity_type: EntityType, id: &str, record: Record) {
        match record {
            Record::Active(entity) => self.upsert(entity_type, entity),
            Record::Deleted(at) => {
                self.delete(entity_type, id, at);
            }
        }
    }

    /// Entity types present as active records or tombstones.
    #[must_use]
    pub fn types(&self) -> BTreeSet<EntityType> {
        self.entities.keys().chain(self.deleted.keys()).copied().collect()
    }

    /// Ids of `entity_type` present as active records or tombstones.
    #[must_use]
    pub fn ids(&self, entity_type: EntityType) -> BTreeSet<String> {
        let active = self.entities.get(&entity_type).into_iter().flat_map(|m| m.keys());
        let deleted = self.deleted.get(&entity_type).into_iter().flat_map(|m| m.keys());
        active.chain(deleted).cloned().collect()
    }

    /// Per-type active and tombstone counts.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<EntityType, EntityCounts> {
        let mut counts: BTreeMap<EntityType, EntityCounts> = BTreeMap::new();
        for (ty, m) in &self.entities {
            if !m.is_empty() {
                counts.entry(*ty).or_default().count = m.len();
            }
        }
        for (ty, m) in &self.deleted {
            if !m.is_empty() {
                counts.entry(*ty).or_default().deleted_count = m.len();
            }
        }
        counts
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.values().all(BTreeMap::is_empty) && self.deleted.values().all(BTreeMap::is_empty)
    }
}

/// Hex SHA-256 of a blob's serialization.
pub fn hash_blob(blob: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(blob).map_err(|e| ShardSyncError::serialization("hash", e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
