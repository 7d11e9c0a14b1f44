//! Query options shared by `get_all` and `observe_all`.
//!
//! # Example
//!
//! ```
//! use shard_sync::{QueryOptions, SortDirection};
//! use serde_json::json;
//!
//! let opts = QueryOptions::new()
//!     .years([2024])
//!     .where_eq("accountId", json!("acc-1"))
//!     .sort_by("date", SortDirection::Desc);
//! assert_eq!(opts.years, Some(vec![2024]));
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::Datelike;
use serde_json::Value;

use crate::entity::{Entity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Filters and ordering applied after shard entities are flattened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Restrict to these ids
    pub ids: Option<BTreeSet<String>>,
    /// Field equality filters, all must match
    pub filters: BTreeMap<String, Value>,
    /// Years to load; `None` means the current year
    pub years: Option<Vec<i32>>,
    /// Sort keys, most significant first
    pub sort: Vec<SortKey>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.insert(field.into(), value);
        self
    }

    #[must_use]
    pub fn years(mut self, years: impl IntoIterator<Item = i32>) -> Self {
        self.years = Some(years.into_iter().collect());
        self
    }

    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    /// Whether `entity` passes the id, equality and year filters.
    #[must_use]
    pub fn matches(&self, entity_type: EntityType, entity: &Entity) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&entity.id) {
                return false;
            }
        }
        let fields_match = self
            .filters
            .iter()
            .all(|(field, expected)| entity.field(field).as_ref() == Some(expected));
        if !fields_match {
            return false;
        }
        match (&self.years, entity_type.config().get_key_date) {
            (Some(years), Some(_)) => entity_type
                .config()
                .key_date(entity)
                .is_some_and(|d| years.contains(&d.year())),
            _ => true,
        }
    }

    /// Filter and sort, returning owned copies.
    pub fn apply<'a, I>(&self, entity_type: EntityType, entities: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        let mut out: Vec<Entity> = entities
            .into_iter()
            .filter(|e| self.matches(entity_type, e))
            .cloned()
            .collect();
        if !self.sort.is_empty() {
            // stable: ties keep shard/id order
            out.sort_by(|a, b| self.compare(a, b));
        }
        out
    }

    fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for key in &self.sort {
            let ord = compare_missing_last(a.field(&key.field).as_ref(), b.field(&key.field).as_ref());
            let ord = match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Ascending order with missing values after present ones.
fn compare_missing_last(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(id: &str, date: &str, amount: Option<i64>) -> Entity {
        let mut e = Entity::from_json(json!({"date": date, "accountId": "acc-1"})).unwrap().with_id(id);
        if let Some(a) = amount {
            e.set_field("amount", json!(a));
        }
        e
    }

    #[test]
    fn test_ids_filter() {
        let all = vec![tx("a", "2024-01-01", None), tx("b", "2024-01-02", None)];
        let out = QueryOptions::new().ids(["b"]).apply(EntityType::Transaction, &all);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "b");
    }

    #[test]
    fn test_where_eq_filter() {
        let mut other = tx("c", "2024-01-01", None);
        other.set_field("accountId", json!("acc-2"));
        let all = vec![tx("a", "2024-01-01", None), other];

        let out = QueryOptions::new()
            .where_eq("accountId", json!("acc-2"))
            .apply(EntityType::Transaction, &all);
        assert_eq!(out.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["c"]);

        let none = QueryOptions::new()
            .where_eq("missing", json!(1))
            .apply(EntityType::Transaction, &all);
        assert!(none.is_empty());
    }

    #[test]
    fn test_year_filter_uses_key_date() {
        let all = vec![
            tx("a", "2023-12-31", None),
            tx("b", "2024-01-01", None),
            tx("c", "2024-12-31", None),
            tx("d", "2025-01-01", None),
        ];
        let out = QueryOptions::new().years([2024]).apply(EntityType::Transaction, &all);
        let ids: Vec<&str> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_year_filter_ignored_for_global_types() {
        let tag = Entity::from_json(json!({"name": "x"})).unwrap().with_id("t");
        let out = QueryOptions::new().years([1999]).apply(EntityType::Tag, [&tag]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_sort_missing_last_ascending_first_descending() {
        let all = vec![
            tx("none", "2024-01-01", None),
            tx("ten", "2024-01-01", Some(10)),
            tx("two", "2024-01-01", Some(2)),
        ];

        let asc = QueryOptions::new()
            .sort_by("amount", SortDirection::Asc)
            .apply(EntityType::Transaction, &all);
        let ids: Vec<&str> = asc.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["two", "ten", "none"]);

        let desc = QueryOptions::new()
            .sort_by("amount", SortDirection::Desc)
            .apply(EntityType::Transaction, &all);
        let ids: Vec<&str> = desc.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["none", "ten", "two"]);
    }

    #[test]
    fn test_multi_key_sort_is_stable() {
        let all = vec![
            tx("a", "2024-02-01", Some(1)),
            tx("b", "2024-01-01", Some(1)),
            tx("c", "2024-01-01", Some(1)),
            tx("d", "2024-01-01", Some(0)),
        ];
        let out = QueryOptions::new()
            .sort_by("amount", SortDirection::Desc)
            .sort_by("date", SortDirection::Asc)
            .apply(EntityType::Transaction, &all);
        let ids: Vec<&str> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn test_apply_returns_copies() {
        let all = vec![tx("a", "2024-01-01", Some(1))];
        let mut out = QueryOptions::new().apply(EntityType::Transaction, &all);
        out[0].set_field("amount", json!(99));
        assert_eq!(all[0].field("amount"), Some(json!(1)));
    }
}
