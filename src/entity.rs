// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity records and the compile-time entity type table.
//!
//! Every record carries the base fields `{id, createdAt, updatedAt, version}`;
//! domain fields ride along in a flattened JSON object. The set of entity
//! types is closed: a blob naming any other type fails to decode, so an
//! unrecognized type can never reach the merge.
//!
//! # Example
//!
//! ```
//! use shard_sync::{Entity, EntityType, Scope};
//! use serde_json::json;
//!
//! let tx = Entity::from_json(json!({"date": "2024-03-14", "amount": -12.5})).unwrap();
//! assert!(tx.id.is_empty()); // assigned on first save
//! assert_eq!(EntityType::Transaction.config().scope, Scope::Monthly);
//! assert_eq!(EntityType::Transaction.config().key_date(&tx).unwrap().to_string(),
//!            "2024-03-14 00:00:00 UTC");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ShardSyncError};

/// Current wall-clock time at the precision every blob stores.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// ISO-8601 codec with millisecond precision.
///
/// Writes `2024-03-14T09:30:00.000Z`; reads any RFC 3339 string and truncates
/// it to milliseconds so values round-trip bit-identically.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc).trunc_subsecs(3))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(de::Error::custom)
    }
}

/// Partitioning granularity of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Yearly,
    Monthly,
}

/// Extracts the date that decides which shard an entity lives in.
pub type KeyDateFn = fn(&Entity) -> Option<DateTime<Utc>>;

/// Per-type partitioning rules.
#[derive(Debug, Clone, Copy)]
pub struct EntityConfig {
    pub scope: Scope,
    /// Field the key date is read from (for error messages)
    pub key_date_field: Option<&'static str>,
    pub get_key_date: Option<KeyDateFn>,
}

impl EntityConfig {
    /// Key date of `entity`, `None` for global types or a missing/invalid field.
    #[must_use]
    pub fn key_date(&self, entity: &Entity) -> Option<DateTime<Utc>> {
        self.get_key_date.and_then(|f| f(entity))
    }
}

/// The closed set of entity types stored in shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Account,
    Budget,
    Tag,
    Transaction,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Account, Self::Budget, Self::Tag, Self::Transaction];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Budget => "budget",
            Self::Tag => "tag",
            Self::Transaction => "transaction",
        }
    }

    /// Partitioning table.
    #[must_use]
    pub fn config(&self) -> EntityConfig {
        match self {
            Self::Account | Self::Tag => EntityConfig {
                scope: Scope::Global,
                key_date_field: None,
                get_key_date: None,
            },
            Self::Budget => EntityConfig {
                scope: Scope::Yearly,
                key_date_field: Some("periodStart"),
                get_key_date: Some(budget_key_date as KeyDateFn),
            },
            Self::Transaction => EntityConfig {
                scope: Scope::Monthly,
                key_date_field: Some("date"),
                get_key_date: Some(transaction_key_date as KeyDateFn),
            },
        }
    }
}

fn budget_key_date(entity: &Entity) -> Option<DateTime<Utc>> {
    entity.date_field("periodStart")
}

fn transaction_key_date(entity: &Entity) -> Option<DateTime<Utc>> {
    entity.date_field("date")
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ShardSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ShardSyncError::format(s, "unknown entity type"))
    }
}

/// A stored record.
///
/// An empty `id` marks a draft that has never been saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(default)]
    pub id: String,
    #[serde(default, with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
    /// Domain fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Draft entity carrying only domain fields.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            id: String::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            version: 0,
            fields,
        }
    }

    /// Draft from a JSON object. Any other JSON value is a `Format` error.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(ShardSyncError::format(other.to_string(), "entity must be a JSON object")),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Field by name, base fields included (`id`, `createdAt`, `updatedAt`, `version`).
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "createdAt" => Some(Value::String(timestamp::format(&self.created_at))),
            "updatedAt" => Some(Value::String(timestamp::format(&self.updated_at))),
            "version" => Some(Value::from(self.version)),
            _ => self.fields.get(name).filter(|v| !v.is_null()).cloned(),
        }
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Parse a domain field as a date: RFC 3339 or a plain `YYYY-MM-DD`.
    #[must_use]
    pub fn date_field(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.fields.get(name)?.as_str()?;
        if let Ok(dt) = timestamp::parse(raw) {
            return Some(dt);
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}
