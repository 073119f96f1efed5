// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted, ordered queue of table operations.
//!
//! Rows live in the operations system table of the local store, so the
//! queue survives restarts. Two in-memory counters mirror it:
//!
//! - `sequence`: last assigned sequence number, restored to the persisted
//!   maximum on [`OperationsQueue::initialize`]
//! - `pending`: number of queued rows, for cheap dirtiness reporting
//!
//! # Locking
//!
//! ```text
//!  table lock (per table)    one push/pull/purge per table at a time
//!  item lock (per item id)   held by enqueue, by push around the replay of
//!                            one operation, and by pull around one item
//!  write lock (queue-wide)   held across validate → local write → collapse,
//!                            and by every other queue row mutation
//! ```
//!
//! Locks are always taken in that order. Holding the write lock
//! ([`OperationsQueue::hold_writes`]) keeps the local store and the queue
//! consistent with each other, which purge relies on.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::locks::{LockMap, NamedLockGuard};
use super::operation::{OperationKind, OperationState, TableOperation};
use crate::error::SyncError;
use crate::metrics;
use crate::query::{Filter, Query};
use crate::storage::LocalStore;
use crate::system::JsonObject;

/// What happened to an operation handed to [`OperationsQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Persisted as a new row.
    Queued { sequence: i64 },
    /// Folded into the operation already queued for the item.
    Collapsed,
    /// Cancelled the queued operation out; nothing remains for the item.
    Cancelled,
}

impl EnqueueOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Collapsed => "collapsed",
            Self::Cancelled => "cancelled",
        }
    }
}

pub struct OperationsQueue {
    store: Arc<dyn LocalStore>,
    table: String,
    /// Push error rows keyed by operation id, dropped with their operation.
    errors_table: Option<String>,
    sequence: AtomicI64,
    pending: AtomicI64,
    initialized: AtomicBool,
    write_lock: Mutex<()>,
    item_locks: LockMap,
    table_locks: LockMap,
}

impl OperationsQueue {
    pub fn new(store: Arc<dyn LocalStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            errors_table: None,
            sequence: AtomicI64::new(0),
            pending: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            item_locks: LockMap::new(),
            table_locks: LockMap::new(),
        }
    }

    #[must_use]
    pub fn with_errors_table(mut self, errors_table: impl Into<String>) -> Self {
        self.errors_table = Some(errors_table.into());
        self
    }

    /// Define the system table and restore the counters from it.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        let _write = self.write_lock.lock().await;
        self.store.define_table(&self.table, &TableOperation::row_schema()).await?;

        let operations = self.load(&Query::new(&self.table)).await?;
        let max_sequence = operations.iter().map(|op| op.sequence).max().unwrap_or(0);
        self.sequence.store(max_sequence, Ordering::SeqCst);
        self.pending.store(operations.len() as i64, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        metrics::set_pending_operations(operations.len() as i64);

        info!(pending = operations.len(), sequence = max_sequence, "Operations queue initialized");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), SyncError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Number of queued operations across all tables.
    #[must_use]
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Name of the system table backing the queue.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn lock_item(&self, item_id: &str) -> NamedLockGuard {
        self.item_locks.acquire(item_id).await
    }

    /// Block every enqueue and queue mutation until the guard is dropped.
    pub async fn hold_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn lock_table(&self, table: &str, token: &CancellationToken) -> Result<NamedLockGuard, SyncError> {
        self.table_locks.acquire_cancellable(table, token).await
    }

    pub async fn lock_tables(&self, tables: &[String], token: &CancellationToken) -> Result<Vec<NamedLockGuard>, SyncError> {
        self.table_locks.acquire_many(tables, token).await
    }

    /// Queue `operation`, collapsing it with whatever is queued for the same
    /// item.
    ///
    /// `apply_local` performs the matching local store write. It runs under
    /// the item and write locks, after collapse validation and before
    /// anything in the queue changes; if either fails nothing is written.
    pub async fn enqueue<F, Fut>(&self, mut operation: TableOperation, apply_local: F) -> Result<EnqueueOutcome, SyncError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), SyncError>> + Send,
    {
        self.ensure_initialized()?;
        let _item = self.lock_item(&operation.item_id).await;
        let _write = self.write_lock.lock().await;

        let existing = self.get_by_item_id(&operation.table_name, &operation.item_id).await?;
        if let Some(existing) = &existing {
            existing.validate_collapse(&operation)?;
        }

        apply_local().await?;

        let mut existing_cancelled = false;
        if let Some(mut existing) = existing {
            existing.collapse(&mut operation);
            if existing.is_cancelled() {
                existing_cancelled = true;
                if self.delete_locked(&existing.id, existing.version).await? {
                    self.drop_error_row(&existing.id).await?;
                }
            } else if existing.is_updated() {
                self.persist(&existing).await?;
            }
        }

        let outcome = if operation.is_cancelled() {
            if existing_cancelled {
                EnqueueOutcome::Cancelled
            } else {
                EnqueueOutcome::Collapsed
            }
        } else {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            operation.sequence = sequence;
            self.persist(&operation).await?;
            let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_pending_operations(pending);
            EnqueueOutcome::Queued { sequence }
        };

        debug!(
            table = %operation.table_name,
            item_id = %operation.item_id,
            kind = %operation.kind,
            outcome = outcome.label(),
            "Enqueued operation"
        );
        metrics::record_enqueue(&operation.kind.to_string(), outcome.label());
        Ok(outcome)
    }

    /// Lowest-sequence operation after `after_sequence`, restricted to
    /// `tables` (all tables when empty).
    pub async fn peek(&self, after_sequence: i64, tables: &[String]) -> Result<Option<TableOperation>, SyncError> {
        let mut query = Query::new(&self.table).with_filter(Filter::gt("sequence", after_sequence));
        if let Some(in_tables) = Filter::any_of("tableName", tables.iter().cloned()) {
            query = query.with_filter(in_tables);
        }
        Ok(self.load(&query).await?.into_iter().min_by_key(|op| op.sequence))
    }

    /// Number of operations queued for one table.
    pub async fn count_pending(&self, table: &str) -> Result<u64, SyncError> {
        let query = Query::new(&self.table).with_filter(Filter::eq("tableName", table));
        Ok(self.store.count(&query).await?)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<TableOperation>, SyncError> {
        match self.store.get_item(&self.table, id).await? {
            Some(record) => Ok(Some(TableOperation::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_item_id(&self, table: &str, item_id: &str) -> Result<Option<TableOperation>, SyncError> {
        let query = Query::new(&self.table)
            .with_filter(Filter::eq("tableName", table))
            .with_filter(Filter::eq("itemId", item_id));
        Ok(self.load(&query).await?.into_iter().next())
    }

    /// All queued operations, optionally for one table, in replay order.
    pub async fn operations(&self, table: Option<&str>) -> Result<Vec<TableOperation>, SyncError> {
        let mut query = Query::new(&self.table);
        if let Some(table) = table {
            query = query.with_filter(Filter::eq("tableName", table));
        }
        let mut operations = self.load(&query).await?;
        operations.sort_by_key(|op| op.sequence);
        Ok(operations)
    }

    /// Distinct table names with queued operations, sorted.
    pub async fn table_names(&self) -> Result<Vec<String>, SyncError> {
        let mut names: Vec<String> = self
            .load(&Query::new(&self.table))
            .await?
            .into_iter()
            .map(|op| op.table_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Persist an in-place change (state, payload) to an operation.
    pub async fn update(&self, operation: &TableOperation) -> Result<(), SyncError> {
        let _write = self.write_lock.lock().await;
        self.persist(operation).await
    }

    /// Move a persisted operation to `state`.
    pub async fn set_state(&self, operation: &mut TableOperation, state: OperationState) -> Result<(), SyncError> {
        operation.state = state;
        self.update(operation).await
    }

    /// Reset a failed operation to Pending with a new payload, bumping its
    /// version. Only deletes keep the payload in the queue; for inserts and
    /// updates the caller writes it to the local store. Returns `false` if
    /// the operation is gone or its version moved on.
    pub async fn update_with_item(&self, id: &str, expected_version: i64, item: Option<JsonObject>) -> Result<bool, SyncError> {
        let _write = self.write_lock.lock().await;
        let Some(mut operation) = self.get_by_id(id).await? else {
            return Ok(false);
        };
        if operation.version != expected_version {
            return Ok(false);
        }
        operation.state = OperationState::Pending;
        operation.bump_version();
        operation.item = if operation.kind == OperationKind::Delete { item } else { None };
        self.persist(&operation).await?;
        Ok(true)
    }

    /// Remove an operation if its version is still `expected_version`.
    /// Returns whether it was removed.
    pub async fn delete(&self, id: &str, expected_version: i64) -> Result<bool, SyncError> {
        let _write = self.write_lock.lock().await;
        self.delete_locked(id, expected_version).await
    }

    /// Remove every operation of a table. Returns how many were removed.
    pub async fn delete_for_table(&self, table: &str) -> Result<u64, SyncError> {
        let _write = self.write_lock.lock().await;
        let operations = self.load(&Query::new(&self.table).with_filter(Filter::eq("tableName", table))).await?;
        self.delete_all_locked(&operations).await
    }

    /// Operations whose item falls inside `query`: deletes are matched on
    /// their stored snapshot, inserts and updates on the current local row.
    pub async fn in_scope(&self, query: &Query) -> Result<Vec<TableOperation>, SyncError> {
        let operations = self.operations(Some(&query.table)).await?;
        if query.filter.is_none() {
            return Ok(operations);
        }

        let mut scoped = Vec::new();
        for operation in operations {
            let item = match &operation.item {
                Some(item) if operation.kind == OperationKind::Delete => Some(item.clone()),
                _ => self.store.get_item(&query.table, &operation.item_id).await?,
            };
            if item.is_some_and(|item| query.matches(&item)) {
                scoped.push(operation);
            }
        }
        Ok(scoped)
    }

    /// Remove every operation inside `query` (see [`Self::in_scope`]) and
    /// return them.
    pub async fn delete_by_query(&self, query: &Query) -> Result<Vec<TableOperation>, SyncError> {
        let operations = self.in_scope(query).await?;
        let _write = self.write_lock.lock().await;
        self.delete_all_locked(&operations).await?;
        Ok(operations)
    }

    async fn delete_all_locked(&self, operations: &[TableOperation]) -> Result<u64, SyncError> {
        let ids: Vec<String> = operations.iter().map(|op| op.id.clone()).collect();
        self.store.delete_ids(&self.table, &ids).await?;
        let pending = self.pending.fetch_sub(ids.len() as i64, Ordering::SeqCst) - ids.len() as i64;
        metrics::set_pending_operations(pending);
        Ok(ids.len() as u64)
    }

    async fn delete_locked(&self, id: &str, expected_version: i64) -> Result<bool, SyncError> {
        match self.get_by_id(id).await? {
            Some(current) if current.version == expected_version => {
                self.store.delete_ids(&self.table, &[id.to_string()]).await?;
                let pending = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::set_pending_operations(pending);
                Ok(true)
            }
            Some(current) => {
                debug!(
                    operation_id = %id,
                    expected_version,
                    actual_version = current.version,
                    "Skipped delete of changed operation"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn drop_error_row(&self, operation_id: &str) -> Result<(), SyncError> {
        if let Some(errors_table) = &self.errors_table {
            self.store.delete_ids(errors_table, &[operation_id.to_string()]).await?;
        }
        Ok(())
    }

    async fn persist(&self, operation: &TableOperation) -> Result<(), SyncError> {
        self.store.upsert(&self.table, &[operation.to_record()], false).await?;
        Ok(())
    }

    async fn load(&self, query: &Query) -> Result<Vec<TableOperation>, SyncError> {
        self.store
            .query(query)
            .await?
            .iter()
            .map(|record| TableOperation::from_record(record).map_err(SyncError::from))
            .collect()
    }
}
