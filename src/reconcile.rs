// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pairwise reconciliation between two backends.
//!
//! Works on whole shard blobs, guided by the per-backend [`Metadata`] roots:
//!
//! ```text
//!  source (A)                                 target (B)
//!     │                                          │
//!  1. root updatedAt equal? ── yes ──► converged, stop
//!  2. merge-join shard hashes ─► only-A / only-B / mismatched
//!  3. only-A shards ───────────── copy verbatim ──►│
//!  4. mismatched: per id tie-break ─ A wins ─────►│ (written now)
//!                                  └ B wins ─► deferred bucket
//!  5.                                         commit B root
//!  6. reload A root:
//!       unchanged → copy only-B shards, apply deferred bucket
//!       moved     → re-resolve each against A's current value
//!     commit A root
//! ```
//!
//! A failure anywhere aborts before the failing side's root is committed. No
//! in-progress state is persisted: the next run re-derives the same diff.
//!
//! # Tie-break
//!
//! | A | B | Winner |
//! |---|---|--------|
//! | active v2 | active v1 | A |
//! | active, same version, later `updatedAt` | active | A |
//! | active, `updatedAt` t1 | tombstone at t2 ≥ t1 | B (delete wins ties) |
//! | tombstone at t1 | active, `updatedAt` t2 > t1 | B (resurrected) |
//! | tombstone t2 | tombstone t1 < t2 | A (later delete) |
//! | anything | nothing | A |

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::entity::EntityType;
use crate::error::Result;
use crate::metadata::{next_after, Metadata};
use crate::shard::{Record, ShardData};
use crate::storage::{Backend, Tier};

/// Which side's value survives for one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Source,
    Target,
    /// Both sides already agree
    Same,
}

/// Resolve one id between the source (A) and target (B) values.
#[must_use]
pub fn resolve(source: Option<&Record>, target: Option<&Record>) -> Winner {
    use Record::{Active, Deleted};

    let by_order = |ord: Ordering| match ord {
        Ordering::Greater => Winner::Source,
        Ordering::Less => Winner::Target,
        Ordering::Equal => Winner::Same,
    };

    match (source, target) {
        (None, None) => Winner::Same,
        (Some(_), None) => Winner::Source,
        (None, Some(_)) => Winner::Target,
        (Some(Active(a)), Some(Active(b))) => {
            by_order(a.version.cmp(&b.version).then(a.updated_at.cmp(&b.updated_at)))
        }
        (Some(Active(a)), Some(Deleted(deleted_at))) => {
            if *deleted_at >= a.updated_at {
                Winner::Target
            } else {
                Winner::Source
            }
        }
        (Some(Deleted(deleted_at)), Some(Active(b))) => {
            if *deleted_at >= b.updated_at {
                Winner::Source
            } else {
                Winner::Target
            }
        }
        (Some(Deleted(a)), Some(Deleted(b))) => by_order(a.cmp(b)),
    }
}

/// Shard-level difference between two roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardDiff {
    pub only_source: Vec<String>,
    pub only_target: Vec<String>,
    /// Present on both sides with different hashes
    pub mismatched: Vec<String>,
}

impl ShardDiff {
    /// Merge-join the two sorted shard indexes.
    #[must_use]
    pub fn compute(source: &Metadata, target: &Metadata) -> Self {
        let mut diff = Self::default();
        let mut a = source.entity_keys.iter().peekable();
        let mut b = target.entity_keys.iter().peekable();

        loop {
            match (a.peek(), b.peek()) {
                (Some((ka, ma)), Some((kb, mb))) => match ka.cmp(kb) {
                    Ordering::Less => {
                        diff.only_source.push((*ka).clone());
                        a.next();
                    }
                    Ordering::Greater => {
                        diff.only_target.push((*kb).clone());
                        b.next();
                    }
                    Ordering::Equal => {
                        if ma.hash != mb.hash {
                            diff.mismatched.push((*ka).clone());
                        }
                        a.next();
                        b.next();
                    }
                },
                (Some((ka, _)), None) => {
                    diff.only_source.push((*ka).clone());
                    a.next();
                }
                (None, Some((kb, _))) => {
                    diff.only_target.push((*kb).clone());
                    b.next();
                }
                (None, None) => break,
            }
        }
        diff
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.only_source.is_empty() && self.only_target.is_empty() && self.mismatched.is_empty()
    }
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub source: Tier,
    pub target: Tier,
    /// Roots matched; nothing was read beyond them
    pub already_converged: bool,
    /// Shards copied verbatim source → target
    pub copied_to_target: usize,
    /// Hash-mismatched shards merged entity by entity
    pub merged: usize,
    /// Shards copied verbatim target → source
    pub copied_to_source: usize,
    /// Target-favoured values written into the source
    pub deferred_applied: usize,
    /// Source root moved during the run
    pub raced: bool,
    /// Shard keys written on the target
    pub target_shards: Vec<String>,
    /// Shard keys written on the source
    pub source_shards: Vec<String>,
}

impl SyncReport {
    fn new(source: Tier, target: Tier) -> Self {
        Self {
            source,
            target,
            already_converged: false,
            copied_to_target: 0,
            merged: 0,
            copied_to_source: 0,
            deferred_applied: 0,
            raced: false,
            target_shards: Vec::new(),
            source_shards: Vec::new(),
        }
    }

    /// Shard keys written on `tier` by this run.
    #[must_use]
    pub fn shards_written_on(&self, tier: Tier) -> &[String] {
        if tier == self.target {
            &self.target_shards
        } else if tier == self.source {
            &self.source_shards
        } else {
            &[]
        }
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.target_shards.len() + self.source_shards.len()
    }
}

/// A target-favoured value waiting for the source recheck.
#[derive(Debug, Clone)]
struct Deferred {
    entity_type: EntityType,
    id: String,
    record: Record,
}

/// One reconciliation run between `source` and `target` under `prefix`.
pub struct Reconciler<'a> {
    prefix: &'a str,
    source: &'a Backend,
    target: &'a Backend,
}

impl<'a> Reconciler<'a> {
    pub fn new(prefix: &'a str, source: &'a Backend, target: &'a Backend) -> Self {
        Self { prefix, source, target }
    }

    #[instrument(skip(self), fields(source = %self.source.tier, target = %self.target.tier))]
    pub async fn run(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let src = self.source.store.as_ref();
        let dst = self.target.store.as_ref();
        let mut report = SyncReport::new(self.source.tier, self.target.tier);

        // 1. Root check
        let source_meta = Metadata::load(src, self.prefix).await?;
        let mut target_meta = Metadata::load(dst, self.prefix).await?;
        if source_meta.updated_at == target_meta.updated_at {
            debug!("Roots match, backends converged");
            report.already_converged = true;
            crate::metrics::record_sync_run(&report, "converged", start.elapsed());
            return Ok(report);
        }

        // 2. Shard-level diff
        let diff = ShardDiff::compute(&source_meta, &target_meta);
        let run_at = next_after(&[source_meta.updated_at, target_meta.updated_at]);
        debug!(
            only_source = diff.only_source.len(),
            only_target = diff.only_target.len(),
            mismatched = diff.mismatched.len(),
            "Shard diff computed"
        );

        // 3. Wholesale copy source → target
        for key in &diff.only_source {
            let Some(blob) = src.load_data(key).await? else {
                warn!(shard = %key, "Indexed shard missing from source, skipping");
                continue;
            };
            dst.store_data(key, &blob).await?;
            if let Some(entry) = source_meta.entity_keys.get(key) {
                target_meta.entity_keys.insert(key.clone(), entry.clone());
            }
            report.copied_to_target += 1;
            report.target_shards.push(key.clone());
        }

        // 4. Entity-level merge of mismatched shards
        let mut deferred: BTreeMap<String, Vec<Deferred>> = BTreeMap::new();
        let mut source_shards: BTreeMap<String, ShardData> = BTreeMap::new();
        for key in &diff.mismatched {
            let source_shard = ShardData::load(src, key).await?.unwrap_or_default();
            let mut target_shard = ShardData::load(dst, key).await?.unwrap_or_default();
            let (written, waiting) = merge_into_target(&source_shard, &mut target_shard);

            if written > 0 {
                target_shard.store(dst, key).await?;
                report.target_shards.push(key.clone());
            }
            target_meta.record_shard(key, &target_shard, run_at)?;
            debug!(shard = %key, written, deferred = waiting.len(), "Shard merged");

            if !waiting.is_empty() {
                deferred.insert(key.clone(), waiting);
            }
            source_shards.insert(key.clone(), source_shard);
            report.merged += 1;
        }

        // 5. Commit target root
        target_meta.updated_at = run_at;
        target_meta.store(dst, self.prefix).await?;

        // 6. Optimistic recheck of the source root
        let mut current = Metadata::load(src, self.prefix).await?;
        if current.updated_at == source_meta.updated_at {
            self.apply_direct(&mut current, &diff, &target_meta, source_shards, deferred, run_at, &mut report)
                .await?;
            current.updated_at = run_at;
        } else {
            warn!(
                observed = %source_meta.updated_at,
                current = %current.updated_at,
                "Source modified during sync, re-resolving against current values"
            );
            report.raced = true;
            crate::metrics::record_sync_race(self.source.tier, self.target.tier);
            self.apply_rechecked(&mut current, &diff, deferred, run_at, &mut report)
                .await?;
            current.updated_at = next_after(&[current.updated_at, run_at]);
        }
        current.store(src, self.prefix).await?;

        info!(
            copied_to_target = report.copied_to_target,
            copied_to_source = report.copied_to_source,
            merged = report.merged,
            deferred_applied = report.deferred_applied,
            raced = report.raced,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reconciliation complete"
        );
        crate::metrics::record_sync_run(&report, "success", start.elapsed());
        Ok(report)
    }

    /// Source root unchanged: its snapshot is still current, apply blindly.
    #[allow(clippy::too_many_arguments)]
    async fn apply_direct(
        &self,
        current: &mut Metadata,
        diff: &ShardDiff,
        target_meta: &Metadata,
        source_shards: BTreeMap<String, ShardData>,
        mut deferred: BTreeMap<String, Vec<Deferred>>,
        run_at: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let src = self.source.store.as_ref();
        let dst = self.target.store.as_ref();

        for key in &diff.only_target {
            let Some(blob) = dst.load_data(key).await? else {
                warn!(shard = %key, "Indexed shard missing from target, skipping");
                continue;
            };
            src.store_data(key, &blob).await?;
            if let Some(entry) = target_meta.entity_keys.get(key) {
                current.entity_keys.insert(key.clone(), entry.clone());
            }
            report.copied_to_source += 1;
            report.source_shards.push(key.clone());
        }

        for (key, mut shard) in source_shards {
            let waiting = deferred.remove(&key).unwrap_or_default();
            if !waiting.is_empty() {
                for entry in waiting {
                    shard.apply(entry.entity_type, &entry.id, entry.record);
                    report.deferred_applied += 1;
                }
                shard.store(src, &key).await?;
                report.source_shards.push(key.clone());
            }
            current.record_shard(&key, &shard, run_at)?;
        }
        Ok(())
    }

    /// Source root moved: a local write landed mid-run. Every value headed
    /// for the source is resolved again against what the source holds now.
    async fn apply_rechecked(
        &self,
        current: &mut Metadata,
        diff: &ShardDiff,
        deferred: BTreeMap<String, Vec<Deferred>>,
        run_at: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let src = self.source.store.as_ref();
        let dst = self.target.store.as_ref();

        for key in &diff.only_target {
            let Some(blob) = dst.load_data(key).await? else {
                continue;
            };
            let Some(mut local) = ShardData::load(src, key).await? else {
                // Still absent locally, nothing to clobber
                let incoming = ShardData::from_blob(key, blob.clone())?;
                src.store_data(key, &blob).await?;
                current.record_shard(key, &incoming, run_at)?;
                report.copied_to_source += 1;
                report.source_shards.push(key.clone());
                continue;
            };
            let incoming = ShardData::from_blob(key, blob)?;
            let mut applied = 0;
            for entity_type in incoming.types() {
                for id in incoming.ids(entity_type) {
                    let theirs = incoming.record(entity_type, &id);
                    let ours = local.record(entity_type, &id);
                    if resolve(ours.as_ref(), theirs.as_ref()) == Winner::Target {
                        if let Some(record) = theirs {
                            local.apply(entity_type, &id, record);
                            applied += 1;
                        }
                    }
                }
            }
            if applied > 0 {
                local.store(src, key).await?;
                current.record_shard(key, &local, run_at)?;
                report.source_shards.push(key.clone());
            }
            report.copied_to_source += 1;
        }

        for (key, waiting) in deferred {
            let mut local = ShardData::load(src, &key).await?.unwrap_or_default();
            let mut applied = 0;
            for entry in waiting {
                let ours = local.record(entry.entity_type, &entry.id);
                if resolve(ours.as_ref(), Some(&entry.record)) == Winner::Target {
                    local.apply(entry.entity_type, &entry.id, entry.record);
                    applied += 1;
                } else {
                    debug!(shard = %key, id = %entry.id, "Deferred value superseded by local write");
                }
            }
            if applied > 0 {
                local.store(src, &key).await?;
                current.record_shard(&key, &local, run_at)?;
                report.source_shards.push(key.clone());
                report.deferred_applied += applied;
            }
        }
        Ok(())
    }
}

/// Resolve every id of two copies of one shard. Source winners are written
/// into `target`; target winners are returned for the source recheck.
fn merge_into_target(source: &ShardData, target: &mut ShardData) -> (usize, Vec<Deferred>) {
    let types: BTreeSet<EntityType> = source.types().into_iter().chain(target.types()).collect();
    let mut written = 0;
    let mut waiting = Vec::new();

    for entity_type in types {
        let ids: BTreeSet<String> = source
            .ids(entity_type)
            .into_iter()
            .chain(target.ids(entity_type))
            .collect();
        for id in ids {
            let ours = source.record(entity_type, &id);
            let theirs = target.record(entity_type, &id);
            match resolve(ours.as_ref(), theirs.as_ref()) {
                Winner::Source => {
                    if let Some(record) = ours {
                        target.apply(entity_type, &id, record);
                        written += 1;
                    }
                }
                Winner::Target => {
                    if let Some(record) = theirs {
                        waiting.push(Deferred { entity_type, id, record });
                    }
                }
                Winner::Same => {}
            }
        }
    }
    (written, waiting)
}

/// Reconcile `source` with `target` under namespace `prefix`.
pub async fn reconcile(prefix: &str, source: &Backend, target: &Backend) -> Result<SyncReport> {
    Reconciler::new(prefix, source, target).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::metadata::ShardMeta;
    use crate::storage::InMemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_710_000_000 + secs, 0).unwrap()
    }

    fn active(version: u64, updated: i64) -> Record {
        let mut e = Entity::from_json(json!({"date": "2024-03-01"})).unwrap().with_id("2024.03.x");
        e.version = version;
        e.updated_at = t(updated);
        Record::Active(e)
    }

    #[test]
    fn test_higher_version_wins() {
        assert_eq!(resolve(Some(&active(2, 0)), Some(&active(1, 50))), Winner::Source);
        assert_eq!(resolve(Some(&active(1, 50)), Some(&active(2, 0))), Winner::Target);
    }

    #[test]
    fn test_equal_version_later_update_wins() {
        assert_eq!(resolve(Some(&active(3, 10)), Some(&active(3, 5))), Winner::Source);
        assert_eq!(resolve(Some(&active(3, 5)), Some(&active(3, 10))), Winner::Target);
        assert_eq!(resolve(Some(&active(3, 5)), Some(&active(3, 5))), Winner::Same);
    }

    #[test]
    fn test_tombstone_at_or_after_update_wins() {
        assert_eq!(resolve(Some(&active(1, 10)), Some(&Record::Deleted(t(10)))), Winner::Target);
        assert_eq!(resolve(Some(&active(1, 10)), Some(&Record::Deleted(t(11)))), Winner::Target);
        assert_eq!(resolve(Some(&Record::Deleted(t(10))), Some(&active(1, 10))), Winner::Source);
    }

    #[test]
    fn test_update_after_tombstone_resurrects() {
        assert_eq!(resolve(Some(&Record::Deleted(t(10))), Some(&active(1, 11))), Winner::Target);
        assert_eq!(resolve(Some(&active(1, 11)), Some(&Record::Deleted(t(10)))), Winner::Source);
    }

    #[test]
    fn test_later_tombstone_wins() {
        let early = Record::Deleted(t(1));
        let late = Record::Deleted(t(2));
        assert_eq!(resolve(Some(&late), Some(&early)), Winner::Source);
        assert_eq!(resolve(Some(&early), Some(&late)), Winner::Target);
        assert_eq!(resolve(Some(&early), Some(&early)), Winner::Same);
    }

    #[test]
    fn test_one_sided_wins_unconditionally() {
        assert_eq!(resolve(Some(&active(1, 0)), None), Winner::Source);
        assert_eq!(resolve(None, Some(&Record::Deleted(t(0)))), Winner::Target);
        assert_eq!(resolve(None, None), Winner::Same);
    }

    fn entry(hash: &str) -> ShardMeta {
        ShardMeta {
            updated_at: t(0),
            hash: hash.to_string(),
            entities: BTreeMap::new(),
        }
    }

    #[test]
    fn test_diff_merge_join() {
        let mut a = Metadata::default();
        let mut b = Metadata::default();
        a.entity_keys.insert("p.2024.01".into(), entry("h1"));
        a.entity_keys.insert("p.2024.02".into(), entry("h2"));
        a.entity_keys.insert("p.2024.04".into(), entry("h4"));
        b.entity_keys.insert("p.2024.02".into(), entry("h2"));
        b.entity_keys.insert("p.2024.03".into(), entry("h3"));
        b.entity_keys.insert("p.2024.04".into(), entry("xx"));
        b.entity_keys.insert("p.global".into(), entry("g"));

        let diff = ShardDiff::compute(&a, &b);
        assert_eq!(diff.only_source, vec!["p.2024.01"]);
        assert_eq!(diff.only_target, vec!["p.2024.03", "p.global"]);
        assert_eq!(diff.mismatched, vec!["p.2024.04"]);
        assert!(!diff.is_empty());
        assert!(ShardDiff::compute(&a, &a).is_empty());
    }

    async fn seed(store: &InMemoryStore, key: &str, shard: &ShardData, at: DateTime<Utc>) {
        shard.store(store, key).await.unwrap();
        let mut meta = Metadata::load(store, "p").await.unwrap();
        meta.updated_at = at;
        meta.record_shard(key, shard, at).unwrap();
        meta.store(store, "p").await.unwrap();
    }

    fn backends() -> (Arc<InMemoryStore>, Arc<InMemoryStore>, Backend, Backend) {
        let a = Arc::new(InMemoryStore::new());
        let b = Arc::new(InMemoryStore::new());
        let ba = Backend::new(Tier::Primary, a.clone());
        let bb = Backend::new(Tier::Local, b.clone());
        (a, b, ba, bb)
    }

    #[tokio::test]
    async fn test_empty_backends_are_converged() {
        let (_, b, ba, bb) = backends();
        let report = reconcile("p", &ba, &bb).await.unwrap();
        assert!(report.already_converged);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_copy_both_directions_then_idempotent() {
        let (a, b, ba, bb) = backends();
        let mut sa = ShardData::new();
        if let Record::Active(e) = active(1, 0) {
            sa.upsert(EntityType::Transaction, e);
        }
        seed(&a, "p.2024.03", &sa, t(100)).await;

        let mut sb = ShardData::new();
        sb.upsert(EntityType::Tag, Entity::from_json(json!({"name": "x"})).unwrap().with_id("t1"));
        seed(&b, "p.global", &sb, t(200)).await;

        let first = reconcile("p", &ba, &bb).await.unwrap();
        assert_eq!(first.copied_to_target, 1);
        assert_eq!(first.copied_to_source, 1);
        assert!(!first.raced);

        let meta_a = Metadata::load(a.as_ref(), "p").await.unwrap();
        let meta_b = Metadata::load(b.as_ref(), "p").await.unwrap();
        assert_eq!(meta_a, meta_b);

        let second = reconcile("p", &ba, &bb).await.unwrap();
        assert!(second.already_converged);
        assert_eq!(second.writes(), 0);
        assert_eq!(Metadata::load(a.as_ref(), "p").await.unwrap(), meta_a);
        assert_eq!(Metadata::load(b.as_ref(), "p").await.unwrap(), meta_b);
    }

    #[tokio::test]
    async fn test_mismatched_shard_converges_to_identical_hash() {
        let (a, b, ba, bb) = backends();
        let mut sa = ShardData::new();
        let mut sb = ShardData::new();
        if let (Record::Active(new), Record::Active(old)) = (active(2, 20), active(1, 10)) {
            sa.upsert(EntityType::Transaction, new);
            sb.upsert(EntityType::Transaction, old);
        }
        sb.delete(EntityType::Transaction, "2024.03.gone", t(5));
        seed(&a, "p.2024.03", &sa, t(100)).await;
        seed(&b, "p.2024.03", &sb, t(200)).await;

        let report = reconcile("p", &ba, &bb).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.deferred_applied, 1);

        let final_a = ShardData::load(a.as_ref(), "p.2024.03").await.unwrap().unwrap();
        let final_b = ShardData::load(b.as_ref(), "p.2024.03").await.unwrap().unwrap();
        assert_eq!(final_a, final_b);
        assert_eq!(final_a.get(EntityType::Transaction, "2024.03.x").unwrap().version, 2);
        assert!(final_a.tombstone(EntityType::Transaction, "2024.03.gone").is_some());

        let meta_a = Metadata::load(a.as_ref(), "p").await.unwrap();
        let meta_b = Metadata::load(b.as_ref(), "p").await.unwrap();
        assert_eq!(meta_a.hash_of("p.2024.03"), meta_b.hash_of("p.2024.03"));
        assert_eq!(meta_a.hash_of("p.2024.03").unwrap(), final_a.content_hash().unwrap());
    }

    #[test]
    fn test_report_shards_written_on() {
        let mut report = SyncReport::new(Tier::Local, Tier::Primary);
        report.target_shards.push("p.global".into());
        assert_eq!(report.shards_written_on(Tier::Primary), ["p.global".to_string()]);
        assert!(report.shards_written_on(Tier::Local).is_empty());
        assert!(report.shards_written_on(Tier::Cloud).is_empty());
    }
}
