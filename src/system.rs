//! System properties carried by every synchronized item.
//!
//! Items are plain JSON objects. The server owns `version`, `updatedAt` and
//! `deleted`; the client owns `id`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// A synchronized item.
pub type JsonObject = Map<String, Value>;

pub const ID: &str = "id";
pub const VERSION: &str = "version";
pub const UPDATED_AT: &str = "updatedAt";
pub const DELETED: &str = "deleted";

const MAX_ID_LEN: usize = 127;
const MAX_TABLE_NAME_LEN: usize = 64;

/// The item's id, if it has a non-empty string one.
#[must_use]
pub fn item_id(item: &JsonObject) -> Option<&str> {
    item.get(ID).and_then(Value::as_str).filter(|id| !id.is_empty())
}

/// The opaque concurrency token assigned by the server.
#[must_use]
pub fn item_version(item: &JsonObject) -> Option<String> {
    match item.get(VERSION)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Server-side modification time. Accepts RFC 3339 strings or unix millis.
#[must_use]
pub fn updated_at(item: &JsonObject) -> Option<DateTime<Utc>> {
    match item.get(UPDATED_AT)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// True if the server marked this item as a tombstone.
#[must_use]
pub fn is_deleted(item: &JsonObject) -> bool {
    item.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}

/// Remove the server-owned fields, keeping `id`. The version is returned
/// separately so the remote call can be made conditional on it.
#[must_use]
pub fn strip_system_properties(item: &JsonObject) -> (JsonObject, Option<String>) {
    let version = item_version(item);
    let stripped = item
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), VERSION | UPDATED_AT | DELETED))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (stripped, version)
}

/// New item id: UUID v4 in simple form, optionally prefixed.
#[must_use]
pub fn generate_id(prefix: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}{id}"),
        _ => id,
    }
}

/// Ids start alphanumeric and may then use `_ . | : -`.
pub fn validate_id(id: &str) -> Result<(), SyncError> {
    let mut chars = id.chars();
    let valid = id.len() <= MAX_ID_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '|' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidItem(format!("invalid item id '{id}'")))
    }
}

/// Application tables start with a letter and use `[A-Za-z0-9_]`.
/// Names starting with `__` are reserved for the engine.
pub fn validate_table_name(name: &str) -> Result<(), SyncError> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_TABLE_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidArgument(format!("invalid table name '{name}'")))
    }
}

/// Render a timestamp the way the server does: RFC 3339, millisecond precision.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> JsonObject {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_strip_keeps_id_and_returns_version() {
        let item = obj(json!({
            "id": "a1", "title": "x", "version": "AAAB",
            "updatedAt": "2024-01-01T00:00:00.000Z", "deleted": false
        }));
        let (stripped, version) = strip_system_properties(&item);
        assert_eq!(version.as_deref(), Some("AAAB"));
        assert_eq!(stripped, obj(json!({"id": "a1", "title": "x"})));
    }

    #[test]
    fn test_updated_at_parses_both_forms() {
        let a = obj(json!({"updatedAt": "2024-03-01T10:00:00.250Z"}));
        let b = obj(json!({"updatedAt": updated_at(&a).unwrap().timestamp_millis()}));
        assert_eq!(updated_at(&a), updated_at(&b));
        assert!(updated_at(&obj(json!({"updatedAt": true}))).is_none());
    }

    #[test]
    fn test_item_id_rejects_empty_and_non_string() {
        assert_eq!(item_id(&obj(json!({"id": "x"}))), Some("x"));
        assert_eq!(item_id(&obj(json!({"id": ""}))), None);
        assert_eq!(item_id(&obj(json!({"id": 7}))), None);
    }

    #[test]
    fn test_generate_id_prefix() {
        let id = generate_id(Some("dev1-"));
        assert!(id.starts_with("dev1-"));
        assert_eq!(id.len(), "dev1-".len() + 32);
        assert!(validate_id(&id).is_ok());
        assert_ne!(generate_id(None), generate_id(None));
    }

    #[test]
    fn test_id_and_table_validation() {
        assert!(validate_id("abc-123:x|y.z_w").is_ok());
        assert!(validate_id("-leading").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id(&"a".repeat(200)).is_err());

        assert!(validate_table_name("todo_items").is_ok());
        assert!(validate_table_name("__operations").is_err());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("has space").is_err());
    }

    #[test]
    fn test_is_deleted_defaults_false() {
        assert!(is_deleted(&obj(json!({"deleted": true}))));
        assert!(!is_deleted(&obj(json!({"deleted": "yes"}))));
        assert!(!is_deleted(&obj(json!({}))));
    }
}
