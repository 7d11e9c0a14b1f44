// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the shard store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `shard_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `pair`: `source->target`, e.g. `local->primary`
//! - `tier`: primary, local, cloud
//! - `operation`: save, delete, get, get_all
//! - `outcome`: success, converged, error

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::entity::EntityType;
use crate::reconcile::SyncReport;
use crate::storage::Tier;

fn pair_label(source: Tier, target: Tier) -> String {
    format!("{source}->{target}")
}

/// Record a finished reconciliation run and what it wrote.
pub fn record_sync_run(report: &SyncReport, outcome: &str, duration: Duration) {
    let pair = pair_label(report.source, report.target);
    counter!(
        "shard_sync_sync_runs_total",
        "pair" => pair.clone(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("shard_sync_sync_seconds", "pair" => pair).record(duration.as_secs_f64());

    record_shards_written(report.target, report.target_shards.len());
    record_shards_written(report.source, report.source_shards.len());
}

/// Record a reconciliation run that aborted with an error.
pub fn record_sync_failure(source: Tier, target: Tier) {
    counter!(
        "shard_sync_sync_runs_total",
        "pair" => pair_label(source, target),
        "outcome" => "error"
    )
    .increment(1);
}

/// Record shard blobs written to a tier
pub fn record_shards_written(tier: Tier, count: usize) {
    if count == 0 {
        return;
    }
    counter!("shard_sync_shards_written_total", "tier" => tier.as_str()).increment(count as u64);
}

/// Record a source root that moved during a reconciliation run
pub fn record_sync_race(source: Tier, target: Tier) {
    counter!("shard_sync_sync_races_total", "pair" => pair_label(source, target)).increment(1);
}

/// Record a sync request folded into one already queued
pub fn record_sync_coalesced(source: Tier, target: Tier) {
    counter!("shard_sync_sync_coalesced_total", "pair" => pair_label(source, target)).increment(1);
}

/// Set queued sync jobs
pub fn set_sync_queue_depth(depth: usize) {
    gauge!("shard_sync_sync_queue_depth").set(depth as f64);
}

/// Record an orchestrator operation
pub fn record_operation(operation: &str, entity_type: EntityType) {
    counter!(
        "shard_sync_operations_total",
        "operation" => operation.to_string(),
        "entity_type" => entity_type.as_str()
    )
    .increment(1);
}

/// Set live observable managers
pub fn set_live_observables(count: usize) {
    gauge!("shard_sync_observables").set(count as f64);
}

/// Set orchestrator state (0=created, 1=loading, 2=running, 3=unloading, 4=unloaded)
pub fn set_orchestrator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Loading" => 1.0,
        "Running" => 2.0,
        "Unloading" => 3.0,
        "Unloaded" => 4.0,
        _ => -1.0,
    };
    gauge!("shard_sync_orchestrator_state").set(value);
}
