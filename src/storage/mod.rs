// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence backends.
//!
//! Backends are opaque key → JSON blob stores. The concrete browser/cloud
//! stores live in the host application; this crate ships an in-memory one.

pub mod memory;
pub mod traits;

use std::fmt;
use std::sync::Arc;

pub use memory::InMemoryStore;
pub use traits::{Persistence, StorageError};

/// Which replica a backend plays in the three-way topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// In-process store the orchestrator reads and writes through
    Primary,
    /// Device-local durable store
    Local,
    /// Optional remote store
    Cloud,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistence backend tagged with the tier it serves.
#[derive(Clone)]
pub struct Backend {
    pub tier: Tier,
    pub store: Arc<dyn Persistence>,
}

impl Backend {
    pub fn new(tier: Tier, store: Arc<dyn Persistence>) -> Self {
        Self { tier, store }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("tier", &self.tier).finish()
    }
}
