// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity ids and shard keys.
//!
//! Ids carry their partition inline, so the owning shard is derived from the
//! id string alone, without I/O:
//!
//! ```text
//! id                      shard key (prefix "p")
//! ab12cd34            →   p.global
//! 2024.ab12cd34       →   p.2024
//! 2024.03.ab12cd34    →   p.2024.03
//! ```
//!
//! # Example
//!
//! ```
//! use shard_sync::{EntityId, EntityKey};
//!
//! let id: EntityId = "2024.03.ab12cd34".parse().unwrap();
//! let key = EntityKey::from_id("p", &id).unwrap();
//! assert_eq!(key.to_string(), "p.2024.03");
//! assert!("a.b.c.d".parse::<EntityId>().is_err());
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::Datelike;

use crate::entity::{Entity, EntityType, Scope};
use crate::error::{Result, ShardSyncError};

const SEPARATOR: char = '.';
const GLOBAL: &str = "global";
const SUFFIX_LEN: usize = 8;

/// The time partition an id or shard key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    Global,
    Year(i32),
    Month(i32, u32),
}

impl Partition {
    #[must_use]
    pub fn scope(&self) -> Scope {
        match self {
            Self::Global => Scope::Global,
            Self::Year(_) => Scope::Yearly,
            Self::Month(..) => Scope::Monthly,
        }
    }

    /// Year of a dated partition.
    #[must_use]
    pub fn year(&self) -> Option<i32> {
        match self {
            Self::Global => None,
            Self::Year(y) | Self::Month(y, _) => Some(*y),
        }
    }

    /// Every partition of `scope` that falls inside `years`, in key order.
    #[must_use]
    pub fn expand(scope: Scope, years: &[i32]) -> Vec<Partition> {
        let mut years = years.to_vec();
        years.sort_unstable();
        years.dedup();
        match scope {
            Scope::Global => vec![Self::Global],
            Scope::Yearly => years.into_iter().map(Self::Year).collect(),
            Scope::Monthly => years
                .into_iter()
                .flat_map(|y| (1..=12).map(move |m| Self::Month(y, m)))
                .collect(),
        }
    }

    fn write_segments(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str(GLOBAL),
            Self::Year(y) => write!(f, "{y:04}"),
            Self::Month(y, m) => write!(f, "{y:04}.{m:02}"),
        }
    }
}

/// Exactly four digits, so a parsed id re-renders to the same string.
fn parse_year(input: &str, segment: &str) -> Result<i32> {
    if segment.len() != 4 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShardSyncError::format(input, format!("'{segment}' is not a year")));
    }
    segment
        .parse()
        .map_err(|_| ShardSyncError::format(input, format!("'{segment}' is not a year")))
}

fn parse_month(input: &str, segment: &str) -> Result<u32> {
    match segment.parse::<u32>() {
        Ok(m @ 1..=12) if segment.len() == 2 => Ok(m),
        _ => Err(ShardSyncError::format(input, format!("'{segment}' is not a month"))),
    }
}

/// Entity id: `<suffix>`, `<year>.<suffix>` or `<year>.<month>.<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    partition: Partition,
    suffix: String,
}

impl EntityId {
    /// Allocate a fresh id for `entity` of `entity_type`.
    ///
    /// Scoped types read the key date through the type's config; a missing
    /// date is an error rather than a silent fallback to the global shard.
    pub fn new(entity_type: EntityType, entity: &Entity) -> Result<Self> {
        let config = entity_type.config();
        let partition = match config.scope {
            Scope::Global => Partition::Global,
            scope => {
                let date = config.key_date(entity).ok_or_else(|| ShardSyncError::MissingKeyDate {
                    entity_type: entity_type.to_string(),
                    field: config.key_date_field.unwrap_or_default().to_string(),
                })?;
                if !(0..=9999).contains(&date.year()) {
                    return Err(ShardSyncError::format(date.to_string(), "key date year out of range"));
                }
                if scope == Scope::Yearly {
                    Partition::Year(date.year())
                } else {
                    Partition::Month(date.year(), date.month())
                }
            }
        };
        Ok(Self {
            partition,
            suffix: random_suffix(),
        })
    }

    #[must_use]
    pub fn partition(&self) -> Partition {
        self.partition
    }

    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

fn random_suffix() -> String {
    let mut simple = uuid::Uuid::new_v4().simple().to_string();
    simple.truncate(SUFFIX_LEN);
    simple
}

impl FromStr for EntityId {
    type Err = ShardSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(SEPARATOR).collect();
        let suffix = segments.last().copied().unwrap_or_default();
        if suffix.is_empty() {
            return Err(ShardSyncError::format(s, "empty id suffix"));
        }
        let partition = match segments.as_slice() {
            [_] => Partition::Global,
            [year, _] => Partition::Year(parse_year(s, year)?),
            [year, month, _] => Partition::Month(parse_year(s, year)?, parse_month(s, month)?),
            _ => {
                return Err(ShardSyncError::format(
                    s,
                    format!("expected 1 to 3 segments, got {}", segments.len()),
                ))
            }
        };
        Ok(Self {
            partition,
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition != Partition::Global {
            self.partition.write_segments(f)?;
            f.write_str(".")?;
        }
        f.write_str(&self.suffix)
    }
}

/// Shard key: `<prefix>.global`, `<prefix>.<year>` or `<prefix>.<year>.<month>`.
///
/// One key names exactly one blob in every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    prefix: String,
    partition: Partition,
}

impl EntityKey {
    pub fn new(prefix: &str, partition: Partition) -> Result<Self> {
        validate_prefix(prefix)?;
        Ok(Self {
            prefix: prefix.to_string(),
            partition,
        })
    }

    /// Shard key owning `id` under `prefix`.
    pub fn from_id(prefix: &str, id: &EntityId) -> Result<Self> {
        Self::new(prefix, id.partition)
    }

    /// Every shard key a query over `years` must touch for `entity_type`.
    pub fn for_years(prefix: &str, entity_type: EntityType, years: &[i32]) -> Result<Vec<Self>> {
        Partition::expand(entity_type.config().scope, years)
            .into_iter()
            .map(|p| Self::new(prefix, p))
            .collect()
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn partition(&self) -> Partition {
        self.partition
    }
}

/// Namespace prefixes are a single non-empty segment.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(ShardSyncError::format(prefix, "empty namespace prefix"));
    }
    if prefix.contains(SEPARATOR) {
        return Err(ShardSyncError::format(prefix, "namespace prefix must not contain '.'"));
    }
    Ok(())
}

impl FromStr for EntityKey {
    type Err = ShardSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(SEPARATOR).collect();
        let partition = match segments.as_slice() {
            [_, GLOBAL] => Partition::Global,
            [_, year] => Partition::Year(parse_year(s, year)?),
            [_, year, month] => Partition::Month(parse_year(s, year)?, parse_month(s, month)?),
            _ => {
                return Err(ShardSyncError::format(
                    s,
                    "expected '<prefix>.global', '<prefix>.<year>' or '<prefix>.<year>.<month>'",
                ))
            }
        };
        Self::new(segments[0], partition)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.prefix)?;
        self.partition.write_segments(f)
    }
}
