//! Delta tokens: the per-(table, query) pull watermark.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;

use crate::query::Query;
use crate::storage::{LocalStore, StoreError};
use crate::system::{item_id, JsonObject};

/// Watermark of a pair that has never been pulled.
pub const MIN_TOKEN: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

#[async_trait]
pub trait DeltaTokenStore: Send + Sync {
    /// Current watermark, [`MIN_TOKEN`] if none is stored.
    async fn get(&self, table: &str, query_id: &str) -> Result<DateTime<Utc>, StoreError>;
    async fn set(&self, table: &str, query_id: &str, value: DateTime<Utc>) -> Result<(), StoreError>;
    async fn reset(&self, table: &str, query_id: &str) -> Result<(), StoreError>;

    /// Forget every watermark of a table, whatever its query id.
    async fn reset_table(&self, table: &str) -> Result<u64, StoreError>;
}

/// Tokens persisted as `{id: "dt.<table>.<query_id>", value: <unix millis>}`
/// rows of the config system table, with a read cache in front.
pub struct StoreDeltaTokens {
    store: Arc<dyn LocalStore>,
    table: String,
    cache: DashMap<String, DateTime<Utc>>,
}

impl StoreDeltaTokens {
    pub fn new(store: Arc<dyn LocalStore>, config_table: impl Into<String>) -> Self {
        Self {
            store,
            table: config_table.into(),
            cache: DashMap::new(),
        }
    }

    /// Shape of a token row, for defining the config table.
    #[must_use]
    pub fn row_schema() -> JsonObject {
        let mut row = JsonObject::new();
        row.insert("id".into(), json!(""));
        row.insert("value".into(), json!(0));
        row
    }

    fn key(table: &str, query_id: &str) -> String {
        format!("dt.{table}.{query_id}")
    }
}

#[async_trait]
impl DeltaTokenStore for StoreDeltaTokens {
    async fn get(&self, table: &str, query_id: &str) -> Result<DateTime<Utc>, StoreError> {
        let key = Self::key(table, query_id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(*cached);
        }

        let value = self
            .store
            .get_item(&self.table, &key)
            .await?
            .and_then(|row| row.get("value").and_then(serde_json::Value::as_i64))
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(MIN_TOKEN);
        self.cache.insert(key, value);
        Ok(value)
    }

    async fn set(&self, table: &str, query_id: &str, value: DateTime<Utc>) -> Result<(), StoreError> {
        let key = Self::key(table, query_id);
        let millis = value.timestamp_millis();
        let mut row = JsonObject::new();
        row.insert("id".into(), json!(key));
        row.insert("value".into(), json!(millis));
        self.store.upsert(&self.table, &[row], false).await?;
        // Cache what a reload reads back, not the finer input.
        let stored = DateTime::from_timestamp_millis(millis).unwrap_or(value);
        self.cache.insert(key, stored);
        Ok(())
    }

    async fn reset(&self, table: &str, query_id: &str) -> Result<(), StoreError> {
        let key = Self::key(table, query_id);
        self.store.delete_ids(&self.table, &[key.clone()]).await?;
        self.cache.remove(&key);
        Ok(())
    }

    async fn reset_table(&self, table: &str) -> Result<u64, StoreError> {
        let prefix = Self::key(table, "");
        let ids: Vec<String> = self
            .store
            .query(&Query::new(&self.table))
            .await?
            .iter()
            .filter_map(|row| item_id(row))
            .filter(|id| id.starts_with(&prefix))
            .map(String::from)
            .collect();
        self.store.delete_ids(&self.table, &ids).await?;
        self.cache.retain(|key, _| !key.starts_with(&prefix));
        Ok(ids.len() as u64)
    }
}
