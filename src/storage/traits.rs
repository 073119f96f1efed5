use async_trait::async_trait;
use thiserror::Error;

use crate::query::Query;
use crate::system::JsonObject;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Table '{0}' is not defined")]
    TableNotDefined(String),
    #[error("Column '{column}' is not defined on table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("Item in table '{0}' has no id")]
    MissingId(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Local persistent store holding application tables and the engine's
/// system tables.
///
/// Column rules: once a table is defined, local writes
/// (`from_server == false`) may only use defined columns; server writes
/// silently drop unknown columns. Undefined tables accept any shape.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Register a table with the columns present in `sample`.
    async fn define_table(&self, table: &str, sample: &JsonObject) -> Result<(), StoreError>;

    async fn get_item(&self, table: &str, id: &str) -> Result<Option<JsonObject>, StoreError>;

    /// Insert or replace whole rows, keyed by `id`.
    async fn upsert(&self, table: &str, items: &[JsonObject], from_server: bool) -> Result<(), StoreError>;

    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Delete every row matching the query. Returns the number removed.
    async fn delete_query(&self, query: &Query) -> Result<u64, StoreError>;

    /// Rows matching the query, ordered by id.
    async fn query(&self, query: &Query) -> Result<Vec<JsonObject>, StoreError>;

    /// Default implementation falls back to a full query.
    async fn count(&self, query: &Query) -> Result<u64, StoreError> {
        Ok(self.query(query).await?.len() as u64)
    }
}
