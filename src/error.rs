// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the shard store.
//!
//! # Error Categories
//!
//! | Error Type | Fatal to caller | Description |
//! |------------|-----------------|-------------|
//! | `Format` | Yes | Malformed id / shard key / namespace string |
//! | `MissingKeyDate` | Yes | Scoped entity without a usable key date |
//! | `Storage` | Yes | Persistence load/store failure (next timer retries syncs) |
//! | `Serialization` | Yes | A blob did not match the shard or metadata schema |
//! | `ShuttingDown` | Yes | Scheduler refuses new awaitable work |
//! | `NotLoaded` | Yes | Lifecycle call made in the wrong state |
//! | `MissingBackend` | Yes | Sync requested against an unconfigured tier |
//!
//! A write that races an in-flight reconciliation is not an error: the
//! reconciler re-resolves against the fresh value instead.

use thiserror::Error;

use crate::storage::{StorageError, Tier};

/// Result type alias for shard store operations.
pub type Result<T> = std::result::Result<T, ShardSyncError>;

/// Errors surfaced by the orchestrator, the reconciler and the scheduler.
///
/// `Clone` so one coalesced sync result can be delivered to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardSyncError {
    /// Malformed entity id, shard key or namespace.
    #[error("Format error in '{input}': {reason}")]
    Format { input: String, reason: String },

    /// A yearly/monthly entity has no key date to derive its shard from.
    #[error("Entity of type '{entity_type}' has no usable key date field '{field}'")]
    MissingKeyDate { entity_type: String, field: String },

    /// Persistence backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Blob (de)serialization failure.
    #[error("Serialization error ({context}): {message}")]
    Serialization { context: String, message: String },

    /// The sync scheduler is draining and accepts no new requests.
    #[error("Sync scheduler is shutting down")]
    ShuttingDown,

    /// Lifecycle state violation.
    #[error("Orchestrator not loaded: {0}")]
    NotLoaded(String),

    /// A sync pair names a tier with no backend attached.
    #[error("No {0} backend configured")]
    MissingBackend(Tier),
}

impl ShardSyncError {
    /// Build a format error for a malformed input string.
    pub fn format(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a serde_json error with the blob it came from.
    pub fn serialization(context: impl Into<String>, err: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Whether the next naturally scheduled sync may succeed where this failed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_display() {
        let err = ShardSyncError::format("a.b.c.d", "expected 1 to 3 segments");
        assert_eq!(
            err.to_string(),
            "Format error in 'a.b.c.d': expected 1 to 3 segments"
        );
    }

    #[test]
    fn test_storage_is_transient() {
        let err: ShardSyncError = StorageError::Backend("disk gone".into()).into();
        assert!(err.is_transient());
        assert!(!ShardSyncError::ShuttingDown.is_transient());
        assert!(!ShardSyncError::format("x", "y").is_transient());
    }

    #[test]
    fn test_serialization_keeps_context() {
        let json_err = serde_json::from_str::<u64>("nope").unwrap_err();
        let err = ShardSyncError::serialization("p.2024.03", json_err);
        assert!(err.to_string().starts_with("Serialization error (p.2024.03)"));
    }

    #[test]
    fn test_missing_backend_names_tier() {
        assert_eq!(
            ShardSyncError::MissingBackend(Tier::Cloud).to_string(),
            "No cloud backend configured"
        );
    }
}
