// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued table operations and their collapsing rules.
//!
//! A [`TableOperation`] is one local mutation waiting to be replayed against
//! the server. At most one live operation exists per `(table, item)`: when a
//! new mutation targets an item that already has one, the two collapse.
//!
//! ```text
//!  existing \ new │ Insert              │ Update                   │ Delete
//! ────────────────┼─────────────────────┼──────────────────────────┼──────────────────────────────
//!  Insert         │ DuplicateInsert     │ new cancelled,           │ both cancelled
//!                 │                     │ existing takes payload   │ (StoreInconsistent once the
//!                 │                     │                          │  insert left Pending)
//!  Update         │ InsertAfterUpdate   │ new cancelled,           │ existing cancelled,
//!                 │                     │ existing takes payload   │ new version bumped
//!  Delete         │ DeleteQueued while Pending, StoreInconsistent once Attempted/Failed
//! ```
//!
//! Validation ([`TableOperation::validate_collapse`]) runs before the local
//! store is touched; [`TableOperation::collapse`] runs after, and only ever
//! mutates the two operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::storage::StoreError;
use crate::system::JsonObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Replay state. Only ever advances: Pending → Attempted → Failed.
/// Error resolution may put an operation back to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Attempted,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Attempted => write!(f, "attempted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableOperation {
    pub id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    pub table_name: String,
    pub item_id: String,
    /// Payload. Persisted only for deletes; inserts and updates reload the
    /// current row from the local store when pushed.
    pub item: Option<JsonObject>,
    /// Assigned by the queue on enqueue.
    pub sequence: i64,
    /// Bumped on every in-place change; guards queue deletes.
    pub version: i64,
    cancelled: bool,
    updated: bool,
}

impl TableOperation {
    pub fn new(kind: OperationKind, table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            state: OperationState::Pending,
            table_name: table_name.into(),
            item_id: item_id.into(),
            item: None,
            sequence: 0,
            version: 1,
            cancelled: false,
            updated: false,
        }
    }

    pub fn insert(table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Insert, table_name, item_id)
    }

    pub fn update(table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Update, table_name, item_id)
    }

    pub fn delete(table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, table_name, item_id)
    }

    #[must_use]
    pub fn with_item(mut self, item: JsonObject) -> Self {
        self.item = Some(item);
        self
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Record an in-place change so that a concurrent version-checked
    /// delete of the old copy fails.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.updated = true;
    }

    /// Deletes keep their payload: the row is gone from the local store.
    #[must_use]
    pub fn persists_item(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    /// The server's response replaces the local row, except for deletes.
    #[must_use]
    pub fn writes_result_to_store(&self) -> bool {
        self.kind != OperationKind::Delete
    }

    /// Check that `new` may be queued while `self` is queued for the same item.
    pub fn validate_collapse(&self, new: &TableOperation) -> Result<(), SyncError> {
        if self.table_name != new.table_name || self.item_id != new.item_id {
            return Err(SyncError::InvalidArgument(format!(
                "operation for {}/{} cannot collapse into {}/{}",
                new.table_name, new.item_id, self.table_name, self.item_id
            )));
        }

        let item_id = || self.item_id.clone();
        use OperationKind::*;
        match (self.kind, new.kind) {
            (Insert, Insert) => Err(SyncError::DuplicateInsert { item_id: item_id() }),
            // The insert may already have reached the server.
            (Insert, Delete) if self.state != OperationState::Pending => {
                Err(SyncError::StoreInconsistent { item_id: item_id() })
            }
            (Insert, _) => Ok(()),
            (Update, Insert) => Err(SyncError::InsertAfterUpdate { item_id: item_id() }),
            (Update, _) => Ok(()),
            (Delete, _) if self.state != OperationState::Pending => {
                Err(SyncError::StoreInconsistent { item_id: item_id() })
            }
            (Delete, _) => Err(SyncError::DeleteQueued { item_id: item_id() }),
        }
    }

    /// Merge `new` into `self`. Call only after [`Self::validate_collapse`]
    /// succeeded and the local store was updated.
    pub fn collapse(&mut self, new: &mut TableOperation) {
        use OperationKind::*;
        match (self.kind, new.kind) {
            (Insert, Update) | (Update, Update) => {
                new.cancel();
                if new.item.is_some() {
                    self.item = new.item.clone();
                }
                self.bump_version();
            }
            (Insert, Delete) => {
                self.cancel();
                new.cancel();
            }
            (Update, Delete) => {
                self.cancel();
                new.bump_version();
            }
            _ => {}
        }
    }

    /// Persisted row shape (see [`Self::row_schema`]).
    #[must_use]
    pub fn to_record(&self) -> JsonObject {
        let item = match (&self.item, self.persists_item()) {
            (Some(item), true) => Value::String(Value::Object(item.clone()).to_string()),
            _ => Value::Null,
        };
        let mut record = JsonObject::new();
        record.insert("id".into(), json!(self.id));
        record.insert("kind".into(), json!(self.kind));
        record.insert("state".into(), json!(self.state));
        record.insert("tableName".into(), json!(self.table_name));
        record.insert("itemId".into(), json!(self.item_id));
        record.insert("item".into(), item);
        record.insert("sequence".into(), json!(self.sequence));
        record.insert("version".into(), json!(self.version));
        record
    }

    pub fn from_record(record: &JsonObject) -> Result<Self, StoreError> {
        fn field<T: serde::de::DeserializeOwned>(record: &JsonObject, name: &str) -> Result<T, StoreError> {
            let value = record.get(name).cloned().unwrap_or(Value::Null);
            Ok(serde_json::from_value(value)?)
        }

        let item = match record.get("item") {
            Some(Value::String(s)) => Some(serde_json::from_str::<JsonObject>(s)?),
            Some(Value::Object(o)) => Some(o.clone()),
            _ => None,
        };

        Ok(Self {
            id: field(record, "id")?,
            kind: field(record, "kind")?,
            state: field(record, "state")?,
            table_name: field(record, "tableName")?,
            item_id: field(record, "itemId")?,
            item,
            sequence: field(record, "sequence")?,
            version: field(record, "version")?,
            cancelled: false,
            updated: false,
        })
    }

    /// Column set of the queue system table.
    #[must_use]
    pub fn row_schema() -> JsonObject {
        Self::insert("", "").to_record()
    }
}
