use serde_json::{json, Value};

use super::operation::{OperationKind, TableOperation};
use crate::storage::StoreError;
use crate::system::JsonObject;

/// A per-item push failure, persisted in the errors system table until the
/// application resolves it.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperationError {
    /// Id of the failed operation; one error row per operation.
    pub id: String,
    /// Version of the operation when it failed. Resolution is refused if the
    /// operation has changed since.
    pub operation_version: i64,
    pub kind: OperationKind,
    pub table_name: String,
    /// Payload that was sent, or a bare `{id}` when the local row was missing.
    pub item: JsonObject,
    pub status: Option<u16>,
    pub raw_result: Option<String>,
    /// `raw_result` parsed as a JSON object, typically the server's copy.
    pub result: Option<JsonObject>,
    pub handled: bool,
}

impl TableOperationError {
    pub fn new(operation: &TableOperation, item: JsonObject, status: Option<u16>, raw_result: Option<String>) -> Self {
        let result = parse_result(raw_result.as_deref());
        Self {
            id: operation.id.clone(),
            operation_version: operation.version,
            kind: operation.kind,
            table_name: operation.table_name.clone(),
            item,
            status,
            raw_result,
            result,
            handled: false,
        }
    }

    #[must_use]
    pub fn item_id(&self) -> Option<&str> {
        crate::system::item_id(&self.item)
    }

    /// 409 or 412: the server holds a different version of the item.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self.status, Some(409 | 412))
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    #[must_use]
    pub fn to_record(&self) -> JsonObject {
        let mut record = JsonObject::new();
        record.insert("id".into(), json!(self.id));
        record.insert("status".into(), json!(self.status));
        record.insert("version".into(), json!(self.operation_version));
        record.insert("kind".into(), json!(self.kind));
        record.insert("tableName".into(), json!(self.table_name));
        record.insert("item".into(), Value::String(Value::Object(self.item.clone()).to_string()));
        record.insert("rawResult".into(), json!(self.raw_result));
        record
    }

    pub fn from_record(record: &JsonObject) -> Result<Self, StoreError> {
        let get = |name: &str| record.get(name).cloned().unwrap_or(Value::Null);
        let item = match get("item") {
            Value::String(s) => serde_json::from_str(&s)?,
            Value::Object(o) => o,
            _ => JsonObject::new(),
        };
        let raw_result: Option<String> = serde_json::from_value(get("rawResult"))?;
        Ok(Self {
            id: serde_json::from_value(get("id"))?,
            operation_version: serde_json::from_value(get("version"))?,
            kind: serde_json::from_value(get("kind"))?,
            table_name: serde_json::from_value(get("tableName"))?,
            item,
            status: serde_json::from_value(get("status"))?,
            result: parse_result(raw_result.as_deref()),
            raw_result,
            handled: false,
        })
    }

    #[must_use]
    pub fn row_schema() -> JsonObject {
        let op = TableOperation::insert("", "");
        Self::new(&op, JsonObject::new(), None, None).to_record()
    }
}

fn parse_result(raw: Option<&str>) -> Option<JsonObject> {
    match serde_json::from_str::<Value>(raw?).ok()? {
        Value::Object(o) => Some(o),
        _ => None,
    }
}
