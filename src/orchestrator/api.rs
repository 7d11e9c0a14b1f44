// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CRUD, query and observe operations.
//!
//! Every write is a read-modify-write of one primary shard followed by a
//! metadata refresh, under the orchestrator's write lock:
//!
//! ```text
//! save(entity)
//!   ├─► id: caller-supplied or freshly allocated from the key date
//!   ├─► load shard ─► stamp createdAt/updatedAt/version ─► store shard
//!   ├─► metadata: recompute hash + counts, touch root ─► store metadata
//!   └─► push `save` to the shard's ObservableManager, if live
//! ```

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, instrument};

use super::DataOrchestrator;
use crate::entity::{self, Entity, EntityType};
use crate::error::{Result, ShardSyncError};
use crate::identity::{EntityId, EntityKey};
use crate::metadata::{next_after, Metadata};
use crate::observable::{ChangeEvent, CollectionObserver, EntityObserver, ObservableManager};
use crate::query::QueryOptions;
use crate::reconcile::SyncReport;
use crate::shard::ShardData;
use crate::storage::Tier;

impl DataOrchestrator {
    /// Get one entity by id, from the live cache if its shard is observed.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        let key = self.shard_key_of(id)?;
        crate::metrics::record_operation("get", entity_type);

        if let Some(manager) = self.cached(&key) {
            return Ok(manager.get(entity_type, id));
        }
        let shard = ShardData::load(self.primary.store.as_ref(), &key).await?;
        Ok(shard.and_then(|s| s.get(entity_type, id).cloned()))
    }

    /// Query across every shard the requested years imply for `entity_type`.
    ///
    /// Returns owned copies; mutating them never touches the cache.
    #[instrument(skip(self, options), fields(entity_type = %entity_type))]
    pub async fn get_all(&self, entity_type: EntityType, options: &QueryOptions) -> Result<Vec<Entity>> {
        let keys = self.shard_keys(entity_type, options)?;
        crate::metrics::record_operation("get_all", entity_type);

        let mut entities = Vec::new();
        for key in &keys {
            if let Some(manager) = self.cached(key) {
                let snapshot = manager.snapshot();
                entities.extend(snapshot.get(&entity_type).into_iter().flat_map(|m| m.values().cloned()));
            } else if let Some(shard) = ShardData::load(self.primary.store.as_ref(), key).await? {
                entities.extend(shard.entities_of(entity_type).cloned());
            }
        }
        debug!(shards = keys.len(), candidates = entities.len(), "Query collected");
        Ok(options.apply(entity_type, &entities))
    }

    /// Create or update an entity.
    ///
    /// A draft (empty id) gets a fresh id derived from its key date. A
    /// caller-supplied id must belong to the type's partition scope. An entity
    /// whose id already exists keeps its `createdAt` and gets the stored
    /// `version` plus one, whatever version the caller sent.
    #[instrument(skip(self, entity), fields(entity_type = %entity_type, id = %entity.id))]
    pub async fn save(&self, entity_type: EntityType, entity: Entity) -> Result<Entity> {
        self.ensure_writable()?;
        let id = if entity.has_id() {
            let id = entity.id.parse::<EntityId>()?;
            let scope = entity_type.config().scope;
            if id.partition().scope() != scope {
                return Err(ShardSyncError::format(
                    entity.id.as_str(),
                    format!("{entity_type} ids must be {scope:?}-partitioned"),
                ));
            }
            id
        } else {
            EntityId::new(entity_type, &entity)?
        };
        let key = EntityKey::from_id(self.namespace(), &id)?.to_string();
        let store = self.primary.store.as_ref();

        let _guard = self.write_lock.lock().await;
        let mut shard = ShardData::load(store, &key).await?.unwrap_or_default();

        let mut saved = entity;
        saved.id = id.to_string();
        let existing = shard.get(entity_type, &saved.id).cloned();
        let tombstone = shard.tombstone(entity_type, &saved.id);

        let mut floors: Vec<DateTime<Utc>> = tombstone.into_iter().collect();
        match existing {
            Some(ref previous) => {
                saved.created_at = previous.created_at;
                saved.version = previous.version + 1;
                floors.push(previous.updated_at);
            }
            None => {
                saved.version += 1;
            }
        }
        saved.updated_at = next_after(&floors);
        if existing.is_none() && saved.created_at == DateTime::<Utc>::default() {
            saved.created_at = saved.updated_at;
        }

        shard.upsert(entity_type, saved.clone());
        shard.store(store, &key).await?;
        self.record_write(&key, &shard).await?;

        if let Some(manager) = self.cached(&key) {
            manager.notify_change(ChangeEvent::save(entity_type, saved.clone()));
        }
        crate::metrics::record_operation("save", entity_type);
        debug!(shard = %key, version = saved.version, "Entity saved");
        Ok(saved)
    }

    /// Tombstone an entity. Returns whether an active record was removed.
    ///
    /// Deleting an unknown id still records a tombstone so a copy of it
    /// arriving later from another backend stays deleted.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        self.ensure_writable()?;
        let key = self.shard_key_of(id)?;
        let store = self.primary.store.as_ref();

        let _guard = self.write_lock.lock().await;
        let mut shard = ShardData::load(store, &key).await?.unwrap_or_default();

        let floors: Vec<DateTime<Utc>> = shard
            .get(entity_type, id)
            .map(|e| e.updated_at)
            .into_iter()
            .chain(shard.tombstone(entity_type, id))
            .collect();
        let removed = shard.delete(entity_type, id, next_after(&floors)).is_some();
        shard.store(store, &key).await?;
        self.record_write(&key, &shard).await?;

        if let Some(manager) = self.cached(&key) {
            manager.notify_change(ChangeEvent::delete(entity_type, id));
        }
        crate::metrics::record_operation("delete", entity_type);
        debug!(shard = %key, removed, "Entity deleted");
        Ok(removed)
    }

    /// Stream of one entity's value.
    pub async fn observe(&self, entity_type: EntityType, id: &str) -> Result<EntityObserver> {
        let key = self.shard_key_of(id)?;
        let manager = self.ensure_manager(&key).await?;
        Ok(manager.observe(entity_type, id))
    }

    /// Stream of a query, recomputed whenever any of its shards changes.
    pub async fn observe_all(&self, entity_type: EntityType, options: QueryOptions) -> Result<CollectionObserver> {
        let keys = self.shard_keys(entity_type, &options)?;
        let mut receivers = Vec::with_capacity(keys.len());
        for key in &keys {
            receivers.push(self.ensure_manager(key).await?.subscribe_collection());
        }
        Ok(CollectionObserver::new(entity_type, options, receivers))
    }

    /// Reconcile `source` into `target` now and wait for the result.
    #[instrument(skip(self))]
    pub async fn sync_now(&self, source: Tier, target: Tier) -> Result<SyncReport> {
        if !self.state().accepts_writes() {
            return Err(ShardSyncError::ShuttingDown);
        }
        let report = self.scheduler.sync(source, target).await?;
        super::refresh_from_report(self.primary.store.as_ref(), &self.observables, &self.write_lock, &report)
            .await;
        Ok(report)
    }

    /// Drop caches nobody observes any more. Returns how many were dropped.
    pub fn prune_idle_observables(&self) -> usize {
        let before = self.observables.len();
        self.observables.retain(|_, manager| !manager.is_idle());
        let pruned = before.saturating_sub(self.observables.len());
        if pruned > 0 {
            debug!(pruned, "Idle observables dropped");
            crate::metrics::set_live_observables(self.observables.len());
        }
        pruned
    }

    fn ensure_writable(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_writes() {
            Ok(())
        } else {
            Err(ShardSyncError::NotLoaded(format!("writes rejected in state {state}")))
        }
    }

    fn shard_key_of(&self, id: &str) -> Result<String> {
        let id: EntityId = id.parse()?;
        Ok(EntityKey::from_id(self.namespace(), &id)?.to_string())
    }

    fn shard_keys(&self, entity_type: EntityType, options: &QueryOptions) -> Result<Vec<String>> {
        let years = options
            .years
            .clone()
            .unwrap_or_else(|| vec![entity::now().year()]);
        Ok(EntityKey::for_years(self.namespace(), entity_type, &years)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    fn cached(&self, key: &str) -> Option<Arc<ObservableManager>> {
        self.observables.get(key).map(|m| Arc::clone(m.value()))
    }

    /// Refresh the shard's metadata entry and advance the root.
    async fn record_write(&self, key: &str, shard: &ShardData) -> Result<()> {
        let store = self.primary.store.as_ref();
        let mut meta = Metadata::load(store, self.namespace()).await?;
        let at = meta.touch();
        meta.record_shard(key, shard, at)?;
        meta.store(store, self.namespace()).await
    }

    /// Live cache for `key`, seeded from the primary store on first use.
    async fn ensure_manager(&self, key: &str) -> Result<Arc<ObservableManager>> {
        if let Some(manager) = self.cached(key) {
            return Ok(manager);
        }
        // Seed under the write lock so no save slips between load and insert
        let _guard = self.write_lock.lock().await;
        if let Some(manager) = self.cached(key) {
            return Ok(manager);
        }
        let shard = ShardData::load(self.primary.store.as_ref(), key).await?.unwrap_or_default();
        let manager = ObservableManager::new(key, &shard);
        self.observables.insert(key.to_string(), Arc::clone(&manager));
        crate::metrics::set_live_observables(self.observables.len());
        Ok(manager)
    }
}
