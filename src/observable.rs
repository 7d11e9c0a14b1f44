// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard reactive cache.
//!
//! Each live shard gets one [`ObservableManager`] holding:
//!
//! ```text
//! collection: watch<Arc<Snapshot>>          (whole shard, copy-on-write)
//! entities:   (type, id) → watch<Option<Entity>> + subscriber count
//! ```
//!
//! Per-id channels are created on first `observe` and dropped when the last
//! [`EntityObserver`] is dropped, so idle ids do not accumulate. Readers only
//! ever see a complete snapshot: every mutation builds the next map and swaps
//! the `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::entity::{Entity, EntityType};
use crate::query::QueryOptions;
use crate::shard::ShardData;

/// Active entities of one shard by type, then id.
pub type Snapshot = BTreeMap<EntityType, BTreeMap<String, Entity>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Save,
    Delete,
}

/// A write applied to a shard.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_type: EntityType,
    pub id: String,
    /// The saved entity (`None` for deletes)
    pub entity: Option<Entity>,
}

impl ChangeEvent {
    pub fn save(entity_type: EntityType, entity: Entity) -> Self {
        Self {
            kind: ChangeKind::Save,
            entity_type,
            id: entity.id.clone(),
            entity: Some(entity),
        }
    }

    pub fn delete(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_type,
            id: id.into(),
            entity: None,
        }
    }
}

type SlotKey = (EntityType, String);

struct Slot {
    tx: watch::Sender<Option<Entity>>,
    subscribers: usize,
}

/// Reactive cache for one shard.
pub struct ObservableManager {
    key: String,
    collection: watch::Sender<Arc<Snapshot>>,
    entities: Mutex<HashMap<SlotKey, Slot>>,
}

impl ObservableManager {
    /// Seed from a full shard load.
    pub fn new(key: impl Into<String>, shard: &ShardData) -> Arc<Self> {
        let (collection, _) = watch::channel(Arc::new(snapshot_of(shard)));
        Arc::new(Self {
            key: key.into(),
            collection,
            entities: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.collection.borrow().clone()
    }

    /// Current value of one entity.
    #[must_use]
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.collection.borrow().get(&entity_type)?.get(id).cloned()
    }

    /// Raw collection receiver, for combining several shards.
    #[must_use]
    pub fn subscribe_collection(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.collection.subscribe()
    }

    /// Subscription-counted stream of one entity.
    pub fn observe(self: &Arc<Self>, entity_type: EntityType, id: &str) -> EntityObserver {
        let slot_key = (entity_type, id.to_string());
        let mut entities = self.entities.lock();
        let slot = entities.entry(slot_key.clone()).or_insert_with(|| Slot {
            tx: watch::channel(self.get(entity_type, id)).0,
            subscribers: 0,
        });
        slot.subscribers += 1;
        EntityObserver {
            rx: slot.tx.subscribe(),
            slot_key,
            manager: Arc::downgrade(self),
        }
    }

    /// Filtered stream of this shard's entities of one type.
    pub fn observe_all(&self, entity_type: EntityType, options: QueryOptions) -> CollectionObserver {
        CollectionObserver::new(entity_type, options, vec![self.subscribe_collection()])
    }

    /// Apply a write: copy-on-write the collection, then push to the per-id channel.
    pub fn notify_change(&self, event: ChangeEvent) {
        self.collection.send_modify(|snap| {
            let next = Arc::make_mut(snap);
            match event.kind {
                ChangeKind::Save => {
                    if let Some(ref entity) = event.entity {
                        next.entry(event.entity_type)
                            .or_default()
                            .insert(event.id.clone(), entity.clone());
                    }
                }
                ChangeKind::Delete => {
                    if let Some(m) = next.get_mut(&event.entity_type) {
                        m.remove(&event.id);
                    }
                }
            }
        });

        let entities = self.entities.lock();
        if let Some(slot) = entities.get(&(event.entity_type, event.id.clone())) {
            slot.tx.send_replace(event.entity);
        }
    }

    /// Replace the whole collection after the shard changed underneath us
    /// (a reconciliation wrote it). Per-id observers are told only about ids
    /// whose value actually changed.
    pub fn replace(&self, shard: &ShardData) {
        let next = Arc::new(snapshot_of(shard));
        let previous = self.collection.send_replace(next.clone());

        let entities = self.entities.lock();
        for ((entity_type, id), slot) in entities.iter() {
            let before = previous.get(entity_type).and_then(|m| m.get(id));
            let after = next.get(entity_type).and_then(|m| m.get(id));
            if before != after {
                slot.tx.send_replace(after.cloned());
            }
        }
        debug!(shard = %self.key, observers = entities.len(), "Observable cache replaced");
    }

    /// Live per-id observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.entities.lock().values().map(|s| s.subscribers).sum()
    }

    /// No per-id observers and no collection subscribers.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.collection.receiver_count() == 0 && self.entities.lock().is_empty()
    }

    fn release(&self, slot_key: &SlotKey) {
        let mut entities = self.entities.lock();
        if let Some(slot) = entities.get_mut(slot_key) {
            slot.subscribers = slot.subscribers.saturating_sub(1);
            if slot.subscribers == 0 {
                entities.remove(slot_key);
            }
        }
    }
}

fn snapshot_of(shard: &ShardData) -> Snapshot {
    shard
        .entities
        .iter()
        .filter(|(_, m)| !m.is_empty())
        .map(|(ty, m)| (*ty, m.clone()))
        .collect()
}

/// Stream of one entity's value. Dropping it unsubscribes.
pub struct EntityObserver {
    rx: watch::Receiver<Option<Entity>>,
    slot_key: SlotKey,
    manager: Weak<ObservableManager>,
}

impl EntityObserver {
    /// Latest value, marking it seen.
    pub fn current(&mut self) -> Option<Entity> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next change. `None` once the shard cache was torn down.
    pub async fn changed(&mut self) -> Option<Option<Entity>> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.slot_key.1
    }
}

impl Drop for EntityObserver {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.slot_key);
        }
    }
}

/// Filtered, flattened stream over one or more shard collections.
pub struct CollectionObserver {
    entity_type: EntityType,
    options: QueryOptions,
    receivers: Vec<watch::Receiver<Arc<Snapshot>>>,
}

impl CollectionObserver {
    pub fn new(
        entity_type: EntityType,
        options: QueryOptions,
        receivers: Vec<watch::Receiver<Arc<Snapshot>>>,
    ) -> Self {
        Self {
            entity_type,
            options,
            receivers,
        }
    }

    /// Current filtered result across all shards, marking every shard seen.
    pub fn current(&mut self) -> Vec<Entity> {
        let snapshots: Vec<Arc<Snapshot>> = self
            .receivers
            .iter_mut()
            .map(|rx| rx.borrow_and_update().clone())
            .collect();
        let entities = snapshots
            .iter()
            .filter_map(|snap| snap.get(&self.entity_type))
            .flat_map(|m| m.values());
        self.options.apply(self.entity_type, entities)
    }

    /// Wait until any shard changes and return the recomputed result.
    /// `None` once a shard cache was torn down.
    pub async fn changed(&mut self) -> Option<Vec<Entity>> {
        if self.receivers.is_empty() {
            return None;
        }
        let (result, _, rest) = futures::future::select_all(
            self.receivers.iter_mut().map(|rx| Box::pin(rx.changed())),
        )
        .await;
        drop(rest);
        result.ok()?;
        Some(self.current())
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.receivers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn tx(id: &str, amount: i64) -> Entity {
        Entity::from_json(json!({"date": "2024-03-01", "amount": amount})).unwrap().with_id(id)
    }

    fn seeded() -> Arc<ObservableManager> {
        let mut shard = ShardData::new();
        shard.upsert(EntityType::Transaction, tx("a", 1));
        ObservableManager::new("p.2024.03", &shard)
    }

    #[test]
    fn test_seeded_from_shard() {
        let mgr = seeded();
        assert_eq!(mgr.key(), "p.2024.03");
        assert_eq!(mgr.get(EntityType::Transaction, "a").unwrap().field("amount"), Some(json!(1)));
        assert!(mgr.get(EntityType::Transaction, "zzz").is_none());
    }

    #[tokio::test]
    async fn test_observe_receives_save_and_delete() {
        let mgr = seeded();
        let mut obs = mgr.observe(EntityType::Transaction, "a");
        assert_eq!(obs.current().unwrap().field("amount"), Some(json!(1)));

        mgr.notify_change(ChangeEvent::save(EntityType::Transaction, tx("a", 2)));
        let next = obs.changed().await.unwrap().unwrap();
        assert_eq!(next.field("amount"), Some(json!(2)));

        mgr.notify_change(ChangeEvent::delete(EntityType::Transaction, "a"));
        assert_eq!(obs.changed().await, Some(None));
    }

    #[test]
    fn test_last_unsubscribe_releases_slot() {
        let mgr = seeded();
        let a = mgr.observe(EntityType::Transaction, "a");
        let b = mgr.observe(EntityType::Transaction, "a");
        assert_eq!(mgr.observer_count(), 2);

        drop(a);
        assert_eq!(mgr.observer_count(), 1);
        assert!(!mgr.is_idle());

        drop(b);
        assert_eq!(mgr.observer_count(), 0);
        assert!(mgr.is_idle());
    }

    #[test]
    fn test_copy_on_write_keeps_old_snapshot_intact() {
        let mgr = seeded();
        let before = mgr.snapshot();
        mgr.notify_change(ChangeEvent::save(EntityType::Transaction, tx("b", 5)));

        assert_eq!(before[&EntityType::Transaction].len(), 1);
        assert_eq!(mgr.snapshot()[&EntityType::Transaction].len(), 2);
    }

    #[tokio::test]
    async fn test_observe_all_applies_options() {
        let mgr = seeded();
        mgr.notify_change(ChangeEvent::save(EntityType::Transaction, tx("b", 5)));

        let mut all = mgr.observe_all(
            EntityType::Transaction,
            QueryOptions::new().where_eq("amount", json!(7)),
        );
        assert!(all.current().is_empty());

        mgr.notify_change(ChangeEvent::save(EntityType::Transaction, tx("c", 7)));
        let out = all.changed().await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "c");
    }

    #[tokio::test]
    async fn test_collection_observer_combines_shards() {
        let march = seeded();
        let april = ObservableManager::new("p.2024.04", &ShardData::new());
        let mut obs = CollectionObserver::new(
            EntityType::Transaction,
            QueryOptions::new(),
            vec![march.subscribe_collection(), april.subscribe_collection()],
        );
        assert_eq!(obs.shard_count(), 2);
        assert_eq!(obs.current().len(), 1);

        april.notify_change(ChangeEvent::save(EntityType::Transaction, tx("z", 3)));
        let out = tokio::time::timeout(Duration::from_secs(1), obs.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_notifies_only_changed_ids() {
        let mgr = seeded();
        let mut other = ShardData::new();
        other.upsert(EntityType::Transaction, tx("a", 1));
        other.upsert(EntityType::Transaction, tx("b", 9));

        let mut a = mgr.observe(EntityType::Transaction, "a");
        let mut b = mgr.observe(EntityType::Transaction, "b");
        a.current();
        b.current();

        mgr.replace(&other);

        let seen_b = tokio::time::timeout(Duration::from_secs(1), b.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen_b.unwrap().field("amount"), Some(json!(9)));
        let a_changed = tokio::time::timeout(Duration::from_millis(50), a.changed()).await;
        assert!(a_changed.is_err(), "unchanged id must not be notified");
    }

    #[tokio::test]
    async fn test_dropping_manager_closes_streams() {
        let mgr = seeded();
        let mut all = mgr.observe_all(EntityType::Transaction, QueryOptions::new());
        let mut one = mgr.observe(EntityType::Transaction, "a");
        drop(mgr);
        assert!(all.changed().await.is_none());
        assert!(one.changed().await.is_none());
    }
}
