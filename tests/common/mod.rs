//! Shared helpers for integration tests.
//!
//! `FlakyStore` wraps an [`InMemoryStore`] with failure injection and a
//! one-shot hook that runs just before a chosen key is written, which is how
//! the race tests slip a local write into the middle of a reconciliation.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};

use shard_sync::{Entity, EntityType, InMemoryStore, Metadata, Persistence, ShardData, StorageError};

pub const PREFIX: &str = "p";

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

// =============================================================================
// Failure-injecting store
// =============================================================================

#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    fail_loads: AtomicBool,
    fail_stores: AtomicBool,
    load_delay_ms: AtomicU64,
    /// Fail only stores to this key
    fail_store_key: Mutex<Option<String>>,
    stores: AtomicU64,
    before_store: Mutex<Option<(String, Hook)>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_loads(&self, on: bool) {
        self.fail_loads.store(on, Ordering::SeqCst);
    }

    /// Sleep this long before every load.
    pub fn delay_loads(&self, delay: Duration) {
        self.load_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_stores(&self, on: bool) {
        self.fail_stores.store(on, Ordering::SeqCst);
    }

    pub fn fail_stores_to(&self, key: Option<&str>) {
        *self.fail_store_key.lock() = key.map(str::to_string);
    }

    /// Number of successful `store_data` calls so far.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::SeqCst)
    }

    /// Run `hook` once, right before the next write to `key`.
    pub fn before_store<F>(&self, key: &str, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        *self.before_store.lock() = Some((key.to_string(), Box::new(hook)));
    }

    fn take_hook(&self, key: &str) -> Option<Hook> {
        let mut slot = self.before_store.lock();
        match slot.as_ref() {
            Some((target, _)) if target == key => slot.take().map(|(_, hook)| hook),
            _ => None,
        }
    }
}

#[async_trait]
impl Persistence for FlakyStore {
    async fn load_data(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("injected load failure: {key}")));
        }
        self.inner.load_data(key).await
    }

    async fn store_data(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        if let Some(hook) = self.take_hook(key) {
            hook().await;
        }
        let targeted = self.fail_store_key.lock().as_deref() == Some(key);
        if targeted || self.fail_stores.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("injected store failure: {key}")));
        }
        self.inner.store_data(key, value).await?;
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_data(&self, key: &str) -> Result<(), StorageError> {
        self.inner.clear_data(key).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_710_000_000 + secs, 0).unwrap()
}

pub fn transaction(id: &str, version: u64, updated: DateTime<Utc>, amount: i64) -> Entity {
    let mut e = Entity::from_json(json!({"date": "2024-03-15", "amount": amount, "accountId": "acc-1"}))
        .unwrap()
        .with_id(id);
    e.version = version;
    e.created_at = at(0);
    e.updated_at = updated;
    e
}

/// Write `entity` into `key` the way a local save does: shard, then the
/// metadata entry, then a fresh root timestamp.
pub async fn write_entity(store: &dyn Persistence, key: &str, entity_type: EntityType, entity: Entity) {
    let mut shard = ShardData::load(store, key).await.unwrap().unwrap_or_default();
    shard.upsert(entity_type, entity);
    commit_shard(store, key, &shard, None).await;
}

/// Like [`write_entity`] with a pinned root timestamp, so two seeded
/// backends never share a root by accident.
pub async fn seed_entity(
    store: &dyn Persistence,
    key: &str,
    entity_type: EntityType,
    entity: Entity,
    root_at: DateTime<Utc>,
) {
    let mut shard = ShardData::load(store, key).await.unwrap().unwrap_or_default();
    shard.upsert(entity_type, entity);
    commit_shard(store, key, &shard, Some(root_at)).await;
}

pub async fn seed_tombstone(
    store: &dyn Persistence,
    key: &str,
    entity_type: EntityType,
    id: &str,
    deleted_at: DateTime<Utc>,
    root_at: DateTime<Utc>,
) {
    let mut shard = ShardData::load(store, key).await.unwrap().unwrap_or_default();
    shard.delete(entity_type, id, deleted_at);
    commit_shard(store, key, &shard, Some(root_at)).await;
}

async fn commit_shard(store: &dyn Persistence, key: &str, shard: &ShardData, root_at: Option<DateTime<Utc>>) {
    shard.store(store, key).await.unwrap();
    let mut meta = Metadata::load(store, PREFIX).await.unwrap();
    let stamp = match root_at {
        Some(root_at) => {
            meta.updated_at = root_at;
            root_at
        }
        None => meta.touch(),
    };
    meta.record_shard(key, shard, stamp).unwrap();
    meta.store(store, PREFIX).await.unwrap();
}

pub async fn shard(store: &dyn Persistence, key: &str) -> ShardData {
    ShardData::load(store, key).await.unwrap().unwrap_or_default()
}

pub async fn root(store: &dyn Persistence) -> Metadata {
    Metadata::load(store, PREFIX).await.unwrap()
}
