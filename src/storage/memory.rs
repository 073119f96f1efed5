use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{conform_row, table_columns};
use super::traits::{LocalStore, StoreError};
use crate::query::Query;
use crate::system::JsonObject;

#[derive(Default)]
struct TableData {
    columns: Option<HashSet<String>>,
    rows: BTreeMap<String, JsonObject>,
}

/// Volatile store for tests and ephemeral sessions.
pub struct InMemoryStore {
    tables: DashMap<String, TableData>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Row count of one table
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Drop every table
    pub fn clear(&self) {
        self.tables.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn define_table(&self, table: &str, sample: &JsonObject) -> Result<(), StoreError> {
        let mut entry = self.tables.entry(table.to_string()).or_default();
        entry.columns = Some(table_columns(sample));
        Ok(())
    }

    async fn get_item(&self, table: &str, id: &str) -> Result<Option<JsonObject>, StoreError> {
        Ok(self.tables.get(table).and_then(|t| t.rows.get(id).cloned()))
    }

    async fn upsert(&self, table: &str, items: &[JsonObject], from_server: bool) -> Result<(), StoreError> {
        let mut entry = self.tables.entry(table.to_string()).or_default();
        // Conform everything first so a bad row leaves the table untouched.
        let rows = items
            .iter()
            .map(|item| conform_row(table, entry.columns.as_ref(), item, from_server))
            .collect::<Result<Vec<_>, _>>()?;
        for (id, row) in rows {
            entry.rows.insert(id, row);
        }
        Ok(())
    }

    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        if let Some(mut entry) = self.tables.get_mut(table) {
            for id in ids {
                entry.rows.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_query(&self, query: &Query) -> Result<u64, StoreError> {
        let Some(mut entry) = self.tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let before = entry.rows.len();
        entry.rows.retain(|_, row| !query.matches(row));
        Ok((before - entry.rows.len()) as u64)
    }

    async fn query(&self, query: &Query) -> Result<Vec<JsonObject>, StoreError> {
        Ok(self
            .tables
            .get(&query.table)
            .map(|t| t.rows.values().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, query: &Query) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .get(&query.table)
            .map_or(0, |t| t.rows.values().filter(|row| query.matches(row)).count() as u64))
    }
}
