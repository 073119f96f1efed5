// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed local store.
//!
//! Every logical table, including the engine's system tables, shares one
//! physical table keyed by `(table_name, id)`:
//!
//! ```sql
//! CREATE TABLE offline_items (
//!   table_name TEXT NOT NULL,
//!   id TEXT NOT NULL,
//!   payload TEXT NOT NULL,   -- the item as a JSON object
//!   PRIMARY KEY (table_name, id)
//! )
//! ```
//!
//! Column definitions registered through `define_table` are kept in
//! `offline_tables` so they survive a restart alongside the data.
//!
//! Filters are evaluated in process after loading the table's rows. Tables
//! on a device are small enough that this beats translating the filter tree
//! into SQL over JSON payloads.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::traits::{LocalStore, StoreError};
use super::{conform_row, table_columns};
use crate::query::Query;
use crate::resilience::retry::{retry, RetryConfig};
use crate::system::JsonObject;

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode(payload: &str) -> Result<JsonObject, StoreError> {
    Ok(serde_json::from_str(payload)?)
}

pub struct SqliteStore {
    pool: SqlitePool,
    columns: RwLock<HashMap<String, HashSet<String>>>,
}

impl SqliteStore {
    /// Connect using a sqlx SQLite URL, e.g. `sqlite:offline.db` or
    /// `sqlite::memory:`. Uses startup-mode retry so a bad path fails fast.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        let in_memory = connection_string.contains(":memory:");
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(backend)?
            .create_if_missing(true);
        Self::connect(options, in_memory).await
    }

    /// Open (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect(options, false).await
    }

    async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<Self, StoreError> {
        let pool = retry("sqlite_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                let pool_options = if in_memory {
                    // Each connection to :memory: is its own database, so keep exactly one alive.
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    SqlitePoolOptions::new()
                        .max_connections(4)
                        .idle_timeout(Duration::from_secs(300))
                };
                pool_options
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(backend)
            }
        })
        .await?;

        let store = Self {
            pool,
            columns: RwLock::new(HashMap::new()),
        };
        if !in_memory {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        store.load_table_definitions().await?;
        info!(in_memory, "SQLite local store ready");
        Ok(store)
    }

    /// Clone of the connection pool.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_items (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (table_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_tables (
                table_name TEXT PRIMARY KEY,
                columns TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn load_table_definitions(&self) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT table_name, columns FROM offline_tables")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut defined = HashMap::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("table_name").map_err(backend)?;
            let columns: String = row.try_get("columns").map_err(backend)?;
            let columns: HashSet<String> = serde_json::from_str(&columns)?;
            defined.insert(table, columns);
        }
        debug!(tables = defined.len(), "Loaded table definitions");
        *self.columns.write() = defined;
        Ok(())
    }

    async fn load_table(&self, table: &str) -> Result<Vec<JsonObject>, StoreError> {
        let rows = retry("sqlite_load_table", &RetryConfig::query(), || async {
            sqlx::query("SELECT payload FROM offline_items WHERE table_name = ? ORDER BY id")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload").map_err(backend)?;
                decode(&payload)
            })
            .collect()
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn define_table(&self, table: &str, sample: &JsonObject) -> Result<(), StoreError> {
        let columns = table_columns(sample);
        let mut sorted: Vec<_> = columns.iter().cloned().collect();
        sorted.sort();

        sqlx::query(
            "INSERT INTO offline_tables (table_name, columns) VALUES (?, ?) \
             ON CONFLICT(table_name) DO UPDATE SET columns = excluded.columns",
        )
        .bind(table)
        .bind(serde_json::to_string(&sorted)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.columns.write().insert(table.to_string(), columns);
        Ok(())
    }

    async fn get_item(&self, table: &str, id: &str) -> Result<Option<JsonObject>, StoreError> {
        let row = retry("sqlite_get_item", &RetryConfig::query(), || async {
            sqlx::query("SELECT payload FROM offline_items WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload").map_err(backend)?;
                Ok(Some(decode(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, table: &str, items: &[JsonObject], from_server: bool) -> Result<(), StoreError> {
        let rows = {
            let columns = self.columns.read();
            items
                .iter()
                .map(|item| conform_row(table, columns.get(table), item, from_server))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for (id, row) in &rows {
            sqlx::query(
                "INSERT INTO offline_items (table_name, id, payload) VALUES (?, ?, ?) \
                 ON CONFLICT(table_name, id) DO UPDATE SET payload = excluded.payload",
            )
            .bind(table)
            .bind(id)
            .bind(serde_json::to_string(row)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for id in ids {
            sqlx::query("DELETE FROM offline_items WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn delete_query(&self, query: &Query) -> Result<u64, StoreError> {
        if query.filter.is_none() {
            let result = sqlx::query("DELETE FROM offline_items WHERE table_name = ?")
                .bind(&query.table)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            return Ok(result.rows_affected());
        }

        let ids: Vec<String> = self
            .query(query)
            .await?
            .iter()
            .filter_map(|row| crate::system::item_id(row).map(String::from))
            .collect();
        self.delete_ids(&query.table, &ids).await?;
        Ok(ids.len() as u64)
    }

    async fn query(&self, query: &Query) -> Result<Vec<JsonObject>, StoreError> {
        let mut rows = self.load_table(&query.table).await?;
        rows.retain(|row| query.matches(row));
        Ok(rows)
    }

    async fn count(&self, query: &Query) -> Result<u64, StoreError> {
        if query.filter.is_some() {
            return Ok(self.query(query).await?.len() as u64);
        }
        let row = sqlx::query("SELECT COUNT(*) AS n FROM offline_items WHERE table_name = ?")
            .bind(&query.table)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let n: i64 = row.try_get("n").map_err(backend)?;
        Ok(n as u64)
    }
}
