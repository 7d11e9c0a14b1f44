// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the shard store.
//!
//! # Example
//!
//! ```
//! use shard_sync::ShardSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ShardSyncConfig::default();
//! assert_eq!(config.namespace, "p");
//! assert_eq!(config.fast_sync_interval_ms, 5_000);
//!
//! // Full config
//! let config = ShardSyncConfig {
//!     namespace: "budget".into(),
//!     fast_sync_interval_ms: 1_000,
//!     slow_sync_interval_secs: 60,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::identity::validate_prefix;

/// Configuration for the data orchestrator.
///
/// All fields have sensible defaults. Two orchestrators sharing one set of
/// backends must use different namespaces.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardSyncConfig {
    /// Shard key prefix, e.g. "p" yields `p.global`, `p.2024.03`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// primary → local sync period in milliseconds (default: 5 s)
    #[serde(default = "default_fast_sync_interval_ms")]
    pub fast_sync_interval_ms: u64,

    /// local → cloud sync period in seconds (default: 5 min)
    #[serde(default = "default_slow_sync_interval_secs")]
    pub slow_sync_interval_secs: u64,

    /// Scheduler drain poll during shutdown
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,

    /// Buffered sync reports per subscriber before it lags
    #[serde(default = "default_report_channel_capacity")]
    pub report_channel_capacity: usize,
}

fn default_namespace() -> String { "p".to_string() }
fn default_fast_sync_interval_ms() -> u64 { 5_000 }
fn default_slow_sync_interval_secs() -> u64 { 300 } // 5 min
fn default_shutdown_poll_ms() -> u64 { 25 }
fn default_report_channel_capacity() -> usize { 64 }

impl Default for ShardSyncConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            fast_sync_interval_ms: default_fast_sync_interval_ms(),
            slow_sync_interval_secs: default_slow_sync_interval_secs(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            report_channel_capacity: default_report_channel_capacity(),
        }
    }
}

impl ShardSyncConfig {
    /// Reject namespaces that would break shard key parsing.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.namespace)
    }

    #[must_use]
    pub fn fast_sync_interval(&self) -> Duration {
        Duration::from_millis(self.fast_sync_interval_ms.max(1))
    }

    #[must_use]
    pub fn slow_sync_interval(&self) -> Duration {
        Duration::from_secs(self.slow_sync_interval_secs.max(1))
    }

    #[must_use]
    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms.max(1))
    }
}
