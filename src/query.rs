// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table queries.
//!
//! A [`Query`] names a table and an optional [`Filter`] tree. The same query
//! is used in two places:
//!
//! - **Locally**: [`Filter::matches`] evaluates it against stored items
//!   (local stores, queue scans, purge scoping).
//! - **Remotely**: [`Query::to_odata`] renders the query string handed to the
//!   remote table client on pull.
//!
//! # Example
//!
//! ```
//! use offline_sync::query::{Filter, Query};
//! use serde_json::json;
//!
//! let q = Query::new("todo").with_filter(Filter::eq("done", false));
//! let item = json!({"id": "1", "done": false});
//! assert!(q.matches(item.as_object().unwrap()));
//! assert_eq!(q.to_odata(None, false), "$filter=(done eq false)");
//! ```

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::system::JsonObject;

/// Predicate over item fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(field.into(), value.into())
    }

    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// `field eq v1 or field eq v2 ...`; `None` for an empty value list.
    pub fn any_of<I, V>(field: &str, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        values
            .into_iter()
            .map(|v| Self::eq(field, v))
            .reduce(Filter::or)
    }

    /// Evaluate against an item. Missing fields compare as `null`.
    #[must_use]
    pub fn matches(&self, item: &JsonObject) -> bool {
        let field = |name: &str| item.get(name).unwrap_or(&Value::Null);
        match self {
            Self::Eq(f, v) => compare(field(f), v) == Some(Ordering::Equal),
            Self::Ne(f, v) => compare(field(f), v) != Some(Ordering::Equal),
            Self::Gt(f, v) => compare(field(f), v) == Some(Ordering::Greater),
            Self::Ge(f, v) => matches!(compare(field(f), v), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt(f, v) => compare(field(f), v) == Some(Ordering::Less),
            Self::Le(f, v) => matches!(compare(field(f), v), Some(Ordering::Less | Ordering::Equal)),
            Self::And(a, b) => a.matches(item) && b.matches(item),
            Self::Or(a, b) => a.matches(item) || b.matches(item),
            Self::Not(a) => !a.matches(item),
        }
    }

    /// OData `$filter` expression.
    #[must_use]
    pub fn to_odata(&self) -> String {
        let cmp = |op: &str, f: &str, v: &Value| format!("({f} {op} {})", literal(v));
        match self {
            Self::Eq(f, v) => cmp("eq", f, v),
            Self::Ne(f, v) => cmp("ne", f, v),
            Self::Gt(f, v) => cmp("gt", f, v),
            Self::Ge(f, v) => cmp("ge", f, v),
            Self::Lt(f, v) => cmp("lt", f, v),
            Self::Le(f, v) => cmp("le", f, v),
            Self::And(a, b) => format!("({} and {})", a.to_odata(), b.to_odata()),
            Self::Or(a, b) => format!("({} or {})", a.to_odata(), b.to_odata()),
            Self::Not(a) => format!("not{}", a.to_odata()),
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(p), Some(q)) => Some(p.cmp(&q)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}

fn literal(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if parse_timestamp(s).is_some() => format!("cast({s},Edm.DateTimeOffset)"),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// A table plus an optional filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filter: Option<Filter>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// AND the given filter into this query.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    #[must_use]
    pub fn matches(&self, item: &JsonObject) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(item))
    }

    /// Query string for the remote table client.
    #[must_use]
    pub fn to_odata(&self, order_by: Option<&str>, include_deleted: bool) -> String {
        let mut parts = Vec::new();
        if let Some(filter) = &self.filter {
            parts.push(format!("$filter={}", filter.to_odata()));
        }
        if let Some(field) = order_by {
            parts.push(format!("$orderby={field}"));
        }
        if include_deleted {
            parts.push("__includedeleted=true".to_string());
        }
        parts.join("&")
    }
}

/// Stable id for a query, used to key its delta token when the caller
/// does not name one.
#[must_use]
pub fn query_id(query: &Query) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.table.as_bytes());
    hasher.update(b"\n");
    if let Some(filter) = &query.filter {
        hasher.update(filter.to_odata().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("q_{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> JsonObject {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_comparisons() {
        let item = obj(json!({"n": 5, "s": "b", "flag": true}));
        assert!(Filter::eq("n", 5).matches(&item));
        assert!(Filter::gt("n", 4.5).matches(&item));
        assert!(Filter::le("n", 5).matches(&item));
        assert!(!Filter::lt("n", 5).matches(&item));
        assert!(Filter::gt("s", "a").matches(&item));
        assert!(Filter::ne("flag", false).matches(&item));
        // Incomparable types never order.
        assert!(!Filter::gt("s", 1).matches(&item));
    }

    #[test]
    fn test_missing_field_is_null() {
        let item = obj(json!({"id": "1"}));
        assert!(Filter::eq("owner", Value::Null).matches(&item));
        assert!(!Filter::eq("owner", "bob").matches(&item));
        assert!(Filter::ne("owner", "bob").matches(&item));
    }

    #[test]
    fn test_timestamps_compare_as_instants() {
        // Same instant, different offsets: lexical order would disagree.
        let item = obj(json!({"updatedAt": "2024-01-01T02:00:00+02:00"}));
        assert!(Filter::eq("updatedAt", "2024-01-01T00:00:00Z").matches(&item));
        assert!(Filter::gt("updatedAt", "2023-12-31T23:59:59.999Z").matches(&item));
    }

    #[test]
    fn test_boolean_combinators() {
        let item = obj(json!({"a": 1, "b": 2}));
        let f = Filter::eq("a", 1).and(Filter::eq("b", 3).or(Filter::eq("b", 2)));
        assert!(f.matches(&item));
        assert!(!f.clone().negate().matches(&item));
        assert!(Filter::any_of("b", [1, 2, 3]).unwrap().matches(&item));
        assert!(Filter::any_of::<_, i64>("b", []).is_none());
    }

    #[test]
    fn test_odata_rendering() {
        let q = Query::new("todo")
            .with_filter(Filter::eq("title", "it's"))
            .with_filter(Filter::gt("updatedAt", "2024-01-01T00:00:00.000Z"));
        assert_eq!(
            q.to_odata(Some("updatedAt"), true),
            "$filter=((title eq 'it''s') and (updatedAt gt cast(2024-01-01T00:00:00.000Z,Edm.DateTimeOffset)))\
             &$orderby=updatedAt&__includedeleted=true"
        );
        assert_eq!(Query::new("todo").to_odata(None, true), "__includedeleted=true");
        assert_eq!(Filter::eq("x", 1).negate().to_odata(), "not(x eq 1)");
    }

    #[test]
    fn test_query_id_is_stable_and_distinct() {
        let a = Query::new("todo").with_filter(Filter::eq("done", false));
        let b = Query::new("todo").with_filter(Filter::eq("done", true));
        assert_eq!(query_id(&a), query_id(&a.clone()));
        assert_ne!(query_id(&a), query_id(&b));
        assert_ne!(query_id(&Query::new("todo")), query_id(&Query::new("notes")));
        assert!(query_id(&a).starts_with("q_"));
        assert_eq!(query_id(&a).len(), 18);
    }
}
