// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestrator lifecycle management: load, unload, background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{refresh_from_report, refresh_observables, Background, DataOrchestrator, Observables, OrchestratorState};
use crate::error::{Result, ShardSyncError};
use crate::reconcile::SyncReport;
use crate::scheduler::SyncScheduler;
use crate::storage::{Persistence, Tier};

impl DataOrchestrator {
    /// Pull remote state and start the periodic syncs.
    ///
    /// Load flow:
    /// 1. cloud → local, if a cloud backend is configured (failure is
    ///    logged; the device keeps working from local data)
    /// 2. local → primary (failure aborts the load)
    /// 3. start the fast primary ↔ local timer and, with a cloud backend,
    ///    the slow local ↔ cloud timer
    #[tracing::instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn load(&self) -> Result<()> {
        let state = self.state();
        if state != OrchestratorState::Created {
            return Err(ShardSyncError::NotLoaded(format!("cannot load from state {state}")));
        }
        let start = std::time::Instant::now();
        self.set_state(OrchestratorState::Loading);

        if self.cloud.is_some() {
            match self.scheduler.sync(Tier::Cloud, Tier::Local).await {
                Ok(report) => debug!(writes = report.writes(), "Pulled cloud into local"),
                Err(e) => warn!(error = %e, "Cloud sync failed during load, continuing with local data"),
            }
        }

        let report = match self.scheduler.sync(Tier::Local, Tier::Primary).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Local sync failed during load");
                self.set_state(OrchestratorState::Created);
                return Err(e);
            }
        };
        refresh_from_report(self.primary.store.as_ref(), &self.observables, &self.write_lock, &report).await;

        self.start_background();
        self.set_state(OrchestratorState::Running);
        info!(
            cloud = self.cloud.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Data orchestrator loaded"
        );
        Ok(())
    }

    /// Stop timers, drain the scheduler, then drop all reactive state.
    ///
    /// Open observers see their streams end. Calling it again is a no-op.
    #[tracing::instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn unload(&self) -> Result<()> {
        if matches!(self.state(), OrchestratorState::Unloading | OrchestratorState::Unloaded) {
            return Ok(());
        }
        self.set_state(OrchestratorState::Unloading);

        let background = self.background.lock().take();
        if let Some(background) = background {
            // Receivers may already be gone
            let _ = background.stop.send(true);
            for task in background.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.scheduler.shutdown().await;

        let dropped = self.observables.len();
        self.observables.clear();
        crate::metrics::set_live_observables(0);

        self.set_state(OrchestratorState::Unloaded);
        info!(observables = dropped, "Data orchestrator unloaded");
        Ok(())
    }

    fn start_background(&self) {
        let (stop, stop_rx) = watch::channel(false);

        let timers = tokio::spawn(run_timers(
            Arc::clone(&self.scheduler),
            self.config.fast_sync_interval(),
            self.config.slow_sync_interval(),
            self.cloud.is_some(),
            stop_rx.clone(),
        ));
        let listener = tokio::spawn(run_report_listener(
            self.scheduler.subscribe(),
            Arc::clone(&self.primary.store),
            Arc::clone(&self.observables),
            Arc::clone(&self.write_lock),
            stop_rx,
        ));

        *self.background.lock() = Some(Background {
            stop,
            tasks: vec![timers, listener],
        });
    }
}

/// Fire the fast and slow sync triggers until told to stop.
async fn run_timers(
    scheduler: Arc<SyncScheduler>,
    fast: Duration,
    slow: Duration,
    has_cloud: bool,
    mut stop: watch::Receiver<bool>,
) {
    let mut fast_tick = interval_at(Instant::now() + fast, fast);
    let mut slow_tick = interval_at(Instant::now() + slow, slow);
    fast_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    slow_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = fast_tick.tick() => scheduler.trigger(Tier::Primary, Tier::Local),
            _ = slow_tick.tick(), if has_cloud => scheduler.trigger(Tier::Local, Tier::Cloud),
            _ = stop.changed() => break,
        }
    }
    debug!("Sync timers stopped");
}

/// Refresh live caches for primary shards each completed sync wrote.
async fn run_report_listener(
    mut reports: broadcast::Receiver<SyncReport>,
    primary: Arc<dyn Persistence>,
    observables: Arc<Observables>,
    write_lock: Arc<Mutex<()>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = reports.recv() => match received {
                Ok(report) => {
                    refresh_from_report(primary.as_ref(), &observables, &write_lock, &report).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync reports lagged, refreshing every observed shard");
                    let keys: Vec<String> = observables.iter().map(|e| e.key().clone()).collect();
                    if let Err(e) = refresh_observables(primary.as_ref(), &observables, &write_lock, &keys).await {
                        warn!(error = %e, "Failed to refresh observables");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stop.changed() => break,
        }
    }
    debug!("Sync report listener stopped");
}
