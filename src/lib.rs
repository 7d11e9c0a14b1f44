//! # Shard Sync
//!
//! A local-first data layer: typed entities live in time-partitioned shards,
//! every write lands in a primary store immediately, and background
//! reconciliation converges the primary, a device-local and an optional cloud
//! backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DataOrchestrator                       │
//! │  • get / get_all / save / delete / observe / observe_all    │
//! │  • shard key derived from the id: p.global, p.2024.03       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ write-through                     │ notify
//!          ▼                                   ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │      Primary store       │     │   ObservableManager      │
//! │  • shard blobs           │     │  • one per live shard    │
//! │  • Metadata root index   │     │  • copy-on-write snapshot│
//! └──────────────────────────┘     └──────────────────────────┘
//!          ▲                                   ▲
//!          │ fast timer                        │ refresh on report
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SyncScheduler                         │
//! │  • FIFO, one run at a time, same-pair requests coalesced    │
//! │  • reconcile(): hash diff → copy / merge → optimistic recheck│
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │ slow timer
//!          ▼                                   ▼
//!   Local store ◄────────────────────────► Cloud store (optional)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use shard_sync::{DataOrchestrator, Entity, EntityType, InMemoryStore, QueryOptions, ShardSyncConfig};
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
//!
//! let tx = orchestrator
//!     .save(EntityType::Transaction, Entity::from_json(json!({"date": "2024-03-15", "amount": 12}))?)
//!     .await?;
//! assert!(tx.id.starts_with("2024.03."));
//!
//! let march = orchestrator
//!     .get_all(EntityType::Transaction, &QueryOptions::new().years([2024]))
//!     .await?;
//! assert_eq!(march.len(), 1);
//!
//! orchestrator.unload().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: the [`DataOrchestrator`] façade and its lifecycle
//! - [`identity`]: entity ids and shard keys
//! - [`shard`] / [`metadata`]: shard payloads and the per-backend root index
//! - [`reconcile`]: pairwise reconciliation and tie-break rules
//! - [`scheduler`]: serialized, coalescing sync queue
//! - [`observable`]: per-shard reactive caches
//! - [`storage`]: the [`Persistence`] trait and an in-memory backend

pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod metrics;
pub mod observable;
pub mod orchestrator;
pub mod query;
pub mod reconcile;
pub mod scheduler;
pub mod shard;
pub mod storage;

pub use config::ShardSyncConfig;
pub use entity::{Entity, EntityType, Scope};
pub use error::{Result, ShardSyncError};
pub use identity::{EntityId, EntityKey, Partition};
pub use metadata::{EntityCounts, Metadata, ShardMeta};
pub use observable::{ChangeEvent, ChangeKind, CollectionObserver, EntityObserver, ObservableManager};
pub use orchestrator::{DataOrchestrator, OrchestratorState};
pub use query::{QueryOptions, SortDirection, SortKey};
pub use reconcile::{reconcile, resolve, Reconciler, ShardDiff, SyncReport, Winner};
pub use scheduler::SyncScheduler;
pub use shard::{Record, ShardData, Tombstone};
pub use storage::{Backend, InMemoryStore, Persistence, StorageError, Tier};
