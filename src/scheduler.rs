// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Serialized, coalescing reconciliation queue.
//!
//! ```text
//!   trigger(a, b) ──┐                      ┌──► broadcast<SyncReport>
//!   sync(a, b) ─────┼──► FIFO ──► worker ──┤
//!   sync(a, b) ─────┘   (pair already      └──► shared watch<result>
//!                        queued → joined)
//! ```
//!
//! One job runs at a time. A request for a pair that is already queued or
//! running joins that job and receives the same result. Timer triggers are
//! fire-and-forget and their failures are only logged; awaitable requests
//! surface the error.
//!
//! A tier registered with a write lock is reconciled only while that lock is
//! held, for the whole run. Writers that take the same lock can then never
//! interleave with a run reading or rewriting that tier.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::config::ShardSyncConfig;
use crate::error::{Result, ShardSyncError};
use crate::reconcile::{reconcile, SyncReport};
use crate::storage::{Backend, Tier};

type Outcome = Option<Result<SyncReport>>;

struct Job {
    source: Tier,
    target: Tier,
    done: watch::Sender<Outcome>,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    /// Queued or running pairs, for coalescing
    pending: HashMap<(Tier, Tier), watch::Receiver<Outcome>>,
    running: bool,
}

pub struct SyncScheduler {
    prefix: String,
    backends: BTreeMap<Tier, Backend>,
    /// Held across every run touching the tier
    write_locks: BTreeMap<Tier, Arc<AsyncMutex<()>>>,
    queue: Mutex<Queue>,
    accepting: AtomicBool,
    reports: broadcast::Sender<SyncReport>,
    poll_interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        prefix: impl Into<String>,
        backends: impl IntoIterator<Item = Backend>,
        config: &ShardSyncConfig,
    ) -> Arc<Self> {
        Self::with_write_locks(prefix, backends, std::iter::empty(), config)
    }

    /// Like [`new`](Self::new), serializing runs on each listed tier with the
    /// given lock.
    pub fn with_write_locks(
        prefix: impl Into<String>,
        backends: impl IntoIterator<Item = Backend>,
        write_locks: impl IntoIterator<Item = (Tier, Arc<AsyncMutex<()>>)>,
        config: &ShardSyncConfig,
    ) -> Arc<Self> {
        let (reports, _) = broadcast::channel(config.report_channel_capacity.max(1));
        Arc::new(Self {
            prefix: prefix.into(),
            backends: backends.into_iter().map(|b| (b.tier, b)).collect(),
            write_locks: write_locks.into_iter().collect(),
            queue: Mutex::new(Queue::default()),
            accepting: AtomicBool::new(true),
            reports,
            poll_interval: config.shutdown_poll(),
        })
    }

    /// Queue a run and return immediately. Failures are logged, not returned.
    pub fn trigger(self: &Arc<Self>, source: Tier, target: Tier) {
        if let Err(e) = self.enqueue(source, target) {
            debug!(%source, %target, error = %e, "Sync trigger ignored");
        }
    }

    /// Queue a run (or join the pending one) and wait for its result.
    pub async fn sync(self: &Arc<Self>, source: Tier, target: Tier) -> Result<SyncReport> {
        let mut rx = self.enqueue(source, target)?;
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ShardSyncError::ShuttingDown)?
            .clone();
        outcome.unwrap_or(Err(ShardSyncError::ShuttingDown))
    }

    /// Reports of every successful run, timer-triggered or not.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.jobs.is_empty() && !queue.running
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting requests and wait until the queue has drained.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        while !self.is_idle() {
            tokio::time::sleep(self.poll_interval).await;
        }
        debug!("Sync scheduler drained");
    }

    fn enqueue(self: &Arc<Self>, source: Tier, target: Tier) -> Result<watch::Receiver<Outcome>> {
        if !self.is_accepting() {
            return Err(ShardSyncError::ShuttingDown);
        }
        for tier in [source, target] {
            if !self.backends.contains_key(&tier) {
                return Err(ShardSyncError::MissingBackend(tier));
            }
        }

        let mut queue = self.queue.lock();
        if let Some(rx) = queue.pending.get(&(source, target)) {
            crate::metrics::record_sync_coalesced(source, target);
            debug!(%source, %target, "Joined pending sync");
            return Ok(rx.clone());
        }

        let (done, rx) = watch::channel(None);
        queue.jobs.push_back(Job { source, target, done });
        queue.pending.insert((source, target), rx.clone());
        crate::metrics::set_sync_queue_depth(queue.jobs.len());

        if !queue.running {
            queue.running = true;
            tokio::spawn(Arc::clone(self).drain());
        }
        Ok(rx)
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };

            let result = self.execute(job.source, job.target).await;

            let depth = {
                let mut queue = self.queue.lock();
                queue.pending.remove(&(job.source, job.target));
                queue.jobs.len()
            };
            crate::metrics::set_sync_queue_depth(depth);

            match &result {
                Ok(report) => {
                    // No subscribers is fine
                    let _ = self.reports.send(report.clone());
                }
                Err(e) => {
                    warn!(source = %job.source, target = %job.target, error = %e, "Sync failed");
                    crate::metrics::record_sync_failure(job.source, job.target);
                }
            }
            job.done.send_replace(Some(result));
        }
    }

    async fn execute(&self, source: Tier, target: Tier) -> Result<SyncReport> {
        let (Some(from), Some(to)) = (self.backends.get(&source), self.backends.get(&target)) else {
            return Err(ShardSyncError::MissingBackend(if self.backends.contains_key(&source) {
                target
            } else {
                source
            }));
        };

        // Tier order, so two locked tiers are always taken the same way round
        let mut guards = Vec::new();
        for tier in BTreeSet::from([source, target]) {
            if let Some(lock) = self.write_locks.get(&tier) {
                guards.push(lock.lock().await);
            }
        }
        reconcile(&self.prefix, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::metadata_key;
    use crate::storage::{InMemoryStore, Persistence, StorageError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    /// Counts root reads and can fail every call.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryStore,
        root_reads: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Persistence for CountingStore {
        async fn load_data(&self, key: &str) -> std::result::Result<Option<Value>, StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("injected failure".into()));
            }
            if key == metadata_key("p") {
                self.root_reads.fetch_add(1, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            self.inner.load_data(key).await
        }

        async fn store_data(&self, key: &str, value: &Value) -> std::result::Result<(), StorageError> {
            self.inner.store_data(key, value).await
        }

        async fn clear_data(&self, key: &str) -> std::result::Result<(), StorageError> {
            self.inner.clear_data(key).await
        }
    }

    fn scheduler(primary: Arc<CountingStore>, local: Arc<CountingStore>) -> Arc<SyncScheduler> {
        SyncScheduler::new(
            "p",
            [Backend::new(Tier::Primary, primary), Backend::new(Tier::Local, local)],
            &ShardSyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let primary = Arc::new(CountingStore::default());
        let local = Arc::new(CountingStore::default());
        let sched = scheduler(primary.clone(), local.clone());

        let (a, b) = tokio::join!(
            sched.sync(Tier::Local, Tier::Primary),
            sched.sync(Tier::Local, Tier::Primary)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        // One run: one root read per side
        assert_eq!(primary.root_reads.load(Ordering::SeqCst), 1);
        assert_eq!(local.root_reads.load(Ordering::SeqCst), 1);
        assert!(sched.is_idle());
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let sched = scheduler(Arc::default(), Arc::default());
        let mut reports = sched.subscribe();

        sched.trigger(Tier::Primary, Tier::Local);
        sched.trigger(Tier::Local, Tier::Primary);
        // Same pair as the first job: joins it
        sched.trigger(Tier::Primary, Tier::Local);
        let last = sched.sync(Tier::Local, Tier::Primary).await.unwrap();
        assert_eq!((last.source, last.target), (Tier::Local, Tier::Primary));

        let first = reports.recv().await.unwrap();
        let second = reports.recv().await.unwrap();
        assert_eq!((first.source, first.target), (Tier::Primary, Tier::Local));
        assert_eq!((second.source, second.target), (Tier::Local, Tier::Primary));
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let sched = scheduler(Arc::default(), Arc::default());
        sched.trigger(Tier::Primary, Tier::Local);
        sched.shutdown().await;
        assert!(sched.is_idle());

        let err = sched.sync(Tier::Primary, Tier::Local).await.unwrap_err();
        assert_eq!(err, ShardSyncError::ShuttingDown);
        sched.trigger(Tier::Primary, Tier::Local);
        assert!(sched.is_idle());
    }

    #[tokio::test]
    async fn test_trigger_failure_is_swallowed_sync_failure_surfaces() {
        let primary = Arc::new(CountingStore::default());
        primary.fail.store(true, Ordering::SeqCst);
        let sched = scheduler(primary, Arc::default());
        let mut reports = sched.subscribe();

        sched.trigger(Tier::Primary, Tier::Local);
        let err = sched.sync(Tier::Local, Tier::Primary).await.unwrap_err();
        assert!(matches!(err, ShardSyncError::Storage(_)));
        assert!(err.is_transient());
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_waits_for_tier_write_lock() {
        let primary = Arc::new(CountingStore::default());
        let lock = Arc::new(AsyncMutex::new(()));
        let sched = SyncScheduler::with_write_locks(
            "p",
            [
                Backend::new(Tier::Primary, primary.clone()),
                Backend::new(Tier::Local, Arc::new(CountingStore::default())),
            ],
            [(Tier::Primary, Arc::clone(&lock))],
            &ShardSyncConfig::default(),
        );

        let writer = lock.lock().await;
        let pending = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.sync(Tier::Local, Tier::Primary).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(primary.root_reads.load(Ordering::SeqCst), 0);
        assert!(!sched.is_idle());

        drop(writer);
        pending.await.unwrap().unwrap();
        assert_eq!(primary.root_reads.load(Ordering::SeqCst), 1);

        // Lock is released once the run ends
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_missing_backend_rejected() {
        let sched = scheduler(Arc::default(), Arc::default());
        let err = sched.sync(Tier::Local, Tier::Cloud).await.unwrap_err();
        assert_eq!(err, ShardSyncError::MissingBackend(Tier::Cloud));
        assert!(sched.is_idle());
    }
}
