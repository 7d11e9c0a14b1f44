// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data orchestrator.
//!
//! The [`DataOrchestrator`] is the application-facing façade tying together:
//! - the primary store every read and write goes through
//! - one [`ObservableManager`] per observed shard
//! - the [`SyncScheduler`] reconciling primary ↔ local ↔ cloud
//!
//! # Lifecycle
//!
//! ```text
//! Created → Loading → Running → Unloading → Unloaded
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use shard_sync::{DataOrchestrator, EntityType, InMemoryStore, OrchestratorState, ShardSyncConfig};
//! use shard_sync::entity::Entity;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> shard_sync::Result<()> {
//! let orchestrator = DataOrchestrator::new(
//!     ShardSyncConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryStore::new()),
//!     None,
//! )?;
//! orchestrator.load().await?;
//! assert_eq!(orchestrator.state(), OrchestratorState::Running);
//!
//! let saved = orchestrator
//!     .save(EntityType::Tag, Entity::from_json(json!({"name": "groceries"}))?)
//!     .await?;
//! assert_eq!(saved.version, 1);
//!
//! orchestrator.unload().await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::OrchestratorState;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::ShardSyncConfig;
use crate::error::Result;
use crate::observable::ObservableManager;
use crate::reconcile::SyncReport;
use crate::scheduler::SyncScheduler;
use crate::shard::ShardData;
use crate::storage::{Backend, Persistence, Tier};

/// Live shard caches keyed by shard key.
pub(crate) type Observables = DashMap<String, Arc<ObservableManager>>;

/// Timer and report-listener tasks started by `load()`.
pub(super) struct Background {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Local-first data layer over a primary, a local and an optional cloud backend.
///
/// # Thread Safety
///
/// `Send + Sync`; share it behind an `Arc`. Writes, cache refreshes and every
/// reconciliation touching the primary store share one internal lock. Runs
/// between local and cloud take no lock and rely on the reconciler's
/// optimistic recheck instead.
pub struct DataOrchestrator {
    pub(super) config: ShardSyncConfig,

    pub(super) primary: Backend,
    pub(super) cloud: Option<Backend>,

    /// Reactive caches for observed shards
    pub(super) observables: Arc<Observables>,

    pub(super) scheduler: Arc<SyncScheduler>,

    /// Serializes read-modify-write of primary shards, cache refreshes and
    /// primary-tier sync runs
    pub(super) write_lock: Arc<Mutex<()>>,

    pub(super) state: watch::Sender<OrchestratorState>,
    pub(super) state_rx: watch::Receiver<OrchestratorState>,

    pub(super) background: parking_lot::Mutex<Option<Background>>,
}

impl DataOrchestrator {
    /// Create an orchestrator in `Created` state.
    ///
    /// Call [`load()`](Self::load) to pull remote state and start the timers.
    pub fn new(
        config: ShardSyncConfig,
        primary: Arc<dyn Persistence>,
        local: Arc<dyn Persistence>,
        cloud: Option<Arc<dyn Persistence>>,
    ) -> Result<Self> {
        config.validate()?;

        let primary = Backend::new(Tier::Primary, primary);
        let local = Backend::new(Tier::Local, local);
        let cloud = cloud.map(|store| Backend::new(Tier::Cloud, store));

        let backends = [Some(primary.clone()), Some(local), cloud.clone()];
        let write_lock = Arc::new(Mutex::new(()));
        let scheduler = SyncScheduler::with_write_locks(
            config.namespace.clone(),
            backends.into_iter().flatten(),
            [(Tier::Primary, Arc::clone(&write_lock))],
            &config,
        );
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Created);

        Ok(Self {
            config,
            primary,
            cloud,
            observables: Arc::new(DashMap::new()),
            scheduler,
            write_lock,
            state: state_tx,
            state_rx,
            background: parking_lot::Mutex::new(None),
        })
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<OrchestratorState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == OrchestratorState::Running
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    #[must_use]
    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Every successful reconciliation, timer-triggered or explicit.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<SyncReport> {
        self.scheduler.subscribe()
    }

    /// Number of shards with a live reactive cache.
    #[must_use]
    pub fn live_observables(&self) -> usize {
        self.observables.len()
    }

    pub(super) fn set_state(&self, state: OrchestratorState) {
        self.state.send_replace(state);
        crate::metrics::set_orchestrator_state(&state.to_string());
    }
}

/// Reload shards from the primary store into their live caches.
///
/// Holds the write lock so a refresh never overwrites a newer local save.
pub(super) async fn refresh_observables(
    primary: &dyn Persistence,
    observables: &Observables,
    write_lock: &Mutex<()>,
    keys: &[String],
) -> Result<usize> {
    let _guard = write_lock.lock().await;
    let mut refreshed = 0;
    for key in keys {
        let Some(manager) = observables.get(key).map(|m| Arc::clone(m.value())) else {
            continue;
        };
        let shard = ShardData::load(primary, key).await?.unwrap_or_default();
        manager.replace(&shard);
        refreshed += 1;
    }
    Ok(refreshed)
}

/// Refresh the caches for every primary shard a report wrote.
pub(super) async fn refresh_from_report(
    primary: &dyn Persistence,
    observables: &Observables,
    write_lock: &Mutex<()>,
    report: &SyncReport,
) {
    let keys = report.shards_written_on(Tier::Primary);
    if keys.is_empty() {
        return;
    }
    if let Err(e) = refresh_observables(primary, observables, write_lock, keys).await {
        warn!(error = %e, "Failed to refresh observables after sync");
    }
}
