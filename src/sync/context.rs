// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The sync context: application-facing façade over the local store, the
//! operation queue, and the push / pull / purge actions.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{InMemoryStore, RemoteClient, SyncContext, SyncContextConfig};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(remote: Arc<dyn RemoteClient>) -> Result<(), offline_sync::SyncError> {
//! let store = Arc::new(InMemoryStore::new());
//! let context = SyncContext::new(SyncContextConfig::default(), store, remote);
//!
//! let item = json!({"title": "buy milk", "done": false}).as_object().cloned().unwrap_or_default();
//! context.define_table("todo", &item).await?;
//! let saved = context.insert_item("todo", item).await?;
//!
//! let token = CancellationToken::new();
//! context.push(&[], &token).await?;
//! # let _ = saved;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{EventSink, SyncEvent};
use super::handler::{DefaultSyncHandler, SyncHandler};
use super::pull::{PullAction, PullOptions};
use super::purge::{PurgeAction, PurgeOptions};
use super::push::{PushAction, PushCompletionResult};
use crate::config::SyncContextConfig;
use crate::delta_token::{DeltaTokenStore, StoreDeltaTokens};
use crate::error::SyncError;
use crate::query::{query_id, Query};
use crate::queue::{OperationKind, OperationsQueue, TableOperation, TableOperationError};
use crate::remote::RemoteClient;
use crate::storage::LocalStore;
use crate::system::{self, JsonObject};

/// Collaborators shared by the actions of one context.
pub(crate) struct SyncServices {
    pub(crate) config: SyncContextConfig,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) handler: Arc<dyn SyncHandler>,
    pub(crate) queue: OperationsQueue,
    pub(crate) delta_tokens: Arc<dyn DeltaTokenStore>,
    pub(crate) events: EventSink,
}

pub struct SyncContext {
    services: SyncServices,
    initialized: OnceCell<()>,
}

impl SyncContext {
    pub fn new(config: SyncContextConfig, store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteClient>) -> Self {
        let queue = OperationsQueue::new(store.clone(), config.operation_queue_table.clone())
            .with_errors_table(config.sync_errors_table.clone());
        let delta_tokens = Arc::new(StoreDeltaTokens::new(store.clone(), config.config_table.clone()));
        let events = EventSink::new(config.event_channel_capacity);
        Self {
            services: SyncServices {
                config,
                store,
                remote,
                handler: Arc::new(DefaultSyncHandler),
                queue,
                delta_tokens,
                events,
            },
            initialized: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.services.handler = handler;
        self
    }

    #[must_use]
    pub fn with_delta_token_store(mut self, delta_tokens: Arc<dyn DeltaTokenStore>) -> Self {
        self.services.delta_tokens = delta_tokens;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncContextConfig {
        &self.services.config
    }

    /// Define the system tables and restore the queue. Every other call
    /// initializes on demand, so calling this is only needed to surface
    /// store errors early. Idempotent.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.initialized
            .get_or_try_init(|| async {
                let services = &self.services;
                let config = &services.config;
                services
                    .store
                    .define_table(&config.sync_errors_table, &TableOperationError::row_schema())
                    .await?;
                services
                    .store
                    .define_table(&config.config_table, &StoreDeltaTokens::row_schema())
                    .await?;
                services.queue.initialize().await?;

                if config.clear_errors_on_initialize {
                    let cleared = services.store.delete_query(&Query::new(&config.sync_errors_table)).await?;
                    debug!(cleared, "Cleared sync errors from previous session");
                }
                info!(pending = services.queue.pending(), "Sync context initialized");
                Ok::<(), SyncError>(())
            })
            .await
            .map(|_| ())
    }

    /// Declare an application table. `sample` lists its columns; local
    /// writes with other columns are rejected.
    pub async fn define_table(&self, table: &str, sample: &JsonObject) -> Result<(), SyncError> {
        system::validate_table_name(table)?;
        self.initialize().await?;
        Ok(self.services.store.define_table(table, sample).await?)
    }

    /// Insert a new item locally and queue it for the server. An id is
    /// generated when the item has none. Returns the stored item.
    pub async fn insert_item(&self, table: &str, item: JsonObject) -> Result<JsonObject, SyncError> {
        system::validate_table_name(table)?;
        self.initialize().await?;

        let mut item = item;
        let id = match item.get(system::ID) {
            None | Some(Value::Null) => {
                let id = system::generate_id(self.services.config.id_prefix.as_deref());
                item.insert(system::ID.into(), json!(id));
                id
            }
            Some(_) => system::item_id(&item)
                .ok_or_else(|| SyncError::InvalidItem("item id must be a non-empty string".into()))?
                .to_string(),
        };
        system::validate_id(&id)?;
        let row = local_row(&item);

        let store = self.services.store.clone();
        let stored = row.clone();
        let item_id = id.clone();
        self.services
            .queue
            .enqueue(TableOperation::insert(table, &id), || async move {
                if store.get_item(table, &item_id).await?.is_some() {
                    return Err(SyncError::ItemAlreadyExists {
                        table: table.to_string(),
                        item_id,
                    });
                }
                store.upsert(table, &[stored], false).await?;
                Ok(())
            })
            .await?;
        Ok(row)
    }

    /// Replace an existing item locally and queue the update. When the new
    /// item carries no version the stored one is kept, so the server update
    /// stays conditional.
    pub async fn replace_item(&self, table: &str, item: JsonObject) -> Result<JsonObject, SyncError> {
        system::validate_table_name(table)?;
        self.initialize().await?;

        let id = system::item_id(&item)
            .ok_or_else(|| SyncError::InvalidItem("replaced item has no id".into()))?
            .to_string();
        system::validate_id(&id)?;
        let mut row = local_row(&item);

        let store = self.services.store.clone();
        let item_id = id.clone();
        let stored = &mut row;
        self.services
            .queue
            .enqueue(TableOperation::update(table, &id), || async move {
                let Some(current) = store.get_item(table, &item_id).await? else {
                    return Err(SyncError::ItemNotFound {
                        table: table.to_string(),
                        item_id,
                    });
                };
                if !stored.contains_key(system::VERSION) {
                    if let Some(version) = current.get(system::VERSION) {
                        stored.insert(system::VERSION.into(), version.clone());
                    }
                }
                store.upsert(table, &[stored.clone()], false).await?;
                Ok(())
            })
            .await?;
        Ok(row)
    }

    /// Delete an item locally and queue the delete. The queued operation
    /// keeps a snapshot of the row for the conditional server call.
    pub async fn delete_item(&self, table: &str, item_id: &str) -> Result<(), SyncError> {
        system::validate_table_name(table)?;
        self.initialize().await?;

        let store = self.services.store.clone();
        let snapshot = match store.get_item(table, item_id).await? {
            Some(row) => row,
            None => {
                let mut bare = JsonObject::new();
                bare.insert(system::ID.into(), json!(item_id));
                bare
            }
        };
        let operation = TableOperation::delete(table, item_id).with_item(snapshot);
        let id = item_id.to_string();
        self.services
            .queue
            .enqueue(operation, || async move {
                if store.get_item(table, &id).await?.is_none() {
                    return Err(SyncError::ItemNotFound {
                        table: table.to_string(),
                        item_id: id,
                    });
                }
                store.delete_ids(table, &[id]).await?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_item(&self, table: &str, item_id: &str) -> Result<Option<JsonObject>, SyncError> {
        self.initialize().await?;
        Ok(self.services.store.get_item(table, item_id).await?)
    }

    pub async fn query_items(&self, query: &Query) -> Result<Vec<JsonObject>, SyncError> {
        self.initialize().await?;
        Ok(self.services.store.query(query).await?)
    }

    pub async fn count_items(&self, query: &Query) -> Result<u64, SyncError> {
        self.initialize().await?;
        Ok(self.services.store.count(query).await?)
    }

    /// Replay queued operations of `tables` (every table when empty).
    ///
    /// Fails with [`SyncError::PushFailed`] when the push stopped early or
    /// left unhandled per-item errors.
    #[tracing::instrument(skip(self, token))]
    pub async fn push(&self, tables: &[&str], token: &CancellationToken) -> Result<PushCompletionResult, SyncError> {
        self.initialize().await?;
        let tables = tables.iter().map(|t| t.to_string()).collect();
        PushAction::new(&self.services, tables, token).execute().await
    }

    /// Fetch server changes for `query` into the local store. Returns the
    /// number of items applied.
    #[tracing::instrument(skip(self, query, options, token), fields(table = %query.table))]
    pub async fn pull(&self, query: Query, options: PullOptions, token: &CancellationToken) -> Result<u64, SyncError> {
        system::validate_table_name(&query.table)?;
        self.initialize().await?;
        let query_id = options.query_id.unwrap_or_else(|| query_id(&query));
        PullAction::new(&self.services, query, query_id, options.push_other_tables, token)
            .execute()
            .await
    }

    /// Remove local rows matching `query` and reset its delta token. Returns
    /// the number of rows removed.
    #[tracing::instrument(skip(self, query, options, token), fields(table = %query.table))]
    pub async fn purge(&self, query: Query, options: PurgeOptions, token: &CancellationToken) -> Result<u64, SyncError> {
        system::validate_table_name(&query.table)?;
        self.initialize().await?;
        let query_id = options.query_id.unwrap_or_else(|| query_id(&query));
        PurgeAction::new(&self.services, query, query_id, options.discard_pending_operations, token)
            .execute()
            .await
    }

    /// Resolve an error by dropping the operation and the local row.
    pub async fn cancel_and_discard_item(&self, error: &mut TableOperationError) -> Result<(), SyncError> {
        self.initialize().await?;
        let item_id = error_item_id(error)?;
        let _item = self.services.queue.lock_item(&item_id).await;
        if self.drop_if_dequeued(error).await? {
            return Ok(());
        }

        self.dequeue_for(error).await?;
        self.services.store.delete_ids(&error.table_name, &[item_id]).await?;
        self.resolved(error).await
    }

    /// Resolve an error by dropping the operation and storing `item`, usually
    /// the server's copy, as the local row.
    pub async fn cancel_and_update_item(&self, error: &mut TableOperationError, item: JsonObject) -> Result<(), SyncError> {
        self.initialize().await?;
        let item_id = error_item_id(error)?;
        ensure_same_item(&item_id, &item)?;
        let _item = self.services.queue.lock_item(&item_id).await;
        if self.drop_if_dequeued(error).await? {
            return Ok(());
        }

        self.dequeue_for(error).await?;
        self.services.store.upsert(&error.table_name, &[item], true).await?;
        self.resolved(error).await
    }

    /// Resolve an error by retrying the operation with `item` on the next
    /// push, typically a merge carrying the server's version.
    pub async fn update_operation(&self, error: &mut TableOperationError, item: JsonObject) -> Result<(), SyncError> {
        self.initialize().await?;
        let item_id = error_item_id(error)?;
        ensure_same_item(&item_id, &item)?;
        let _item = self.services.queue.lock_item(&item_id).await;
        if self.drop_if_dequeued(error).await? {
            return Ok(());
        }

        let queued = self
            .services
            .queue
            .update_with_item(&error.id, error.operation_version, Some(item.clone()))
            .await?;
        if !queued {
            return Err(SyncError::OperationChanged {
                operation_id: error.id.clone(),
            });
        }
        if error.kind != OperationKind::Delete {
            self.services.store.upsert(&error.table_name, &[item], false).await?;
        }
        self.resolved(error).await
    }

    /// An error whose operation left the queue (a later delete collapsed
    /// it away) has nothing to resolve; its row is just removed.
    async fn drop_if_dequeued(&self, error: &mut TableOperationError) -> Result<bool, SyncError> {
        if self.services.queue.get_by_id(&error.id).await?.is_some() {
            return Ok(false);
        }
        debug!(operation_id = %error.id, "Dropping error of an operation no longer queued");
        self.resolved(error).await?;
        Ok(true)
    }

    async fn dequeue_for(&self, error: &TableOperationError) -> Result<(), SyncError> {
        if self.services.queue.delete(&error.id, error.operation_version).await? {
            Ok(())
        } else {
            Err(SyncError::OperationChanged {
                operation_id: error.id.clone(),
            })
        }
    }

    async fn resolved(&self, error: &mut TableOperationError) -> Result<(), SyncError> {
        self.services
            .store
            .delete_ids(&self.services.config.sync_errors_table, &[error.id.clone()])
            .await?;
        error.mark_handled();
        debug!(operation_id = %error.id, table = %error.table_name, "Resolved sync error");
        Ok(())
    }

    /// Number of queued operations across all tables.
    pub async fn pending_operations(&self) -> Result<i64, SyncError> {
        self.initialize().await?;
        Ok(self.services.queue.pending())
    }

    /// Queued operations, optionally for one table, in replay order.
    pub async fn queued_operations(&self, table: Option<&str>) -> Result<Vec<TableOperation>, SyncError> {
        self.initialize().await?;
        self.services.queue.operations(table).await
    }

    /// Persisted per-item push errors.
    pub async fn sync_errors(&self) -> Result<Vec<TableOperationError>, SyncError> {
        self.initialize().await?;
        self.services
            .store
            .query(&Query::new(&self.services.config.sync_errors_table))
            .await?
            .iter()
            .map(|record| TableOperationError::from_record(record).map_err(SyncError::from))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.services.events.subscribe()
    }
}

/// Item as written locally: server metadata dropped except the version.
fn local_row(item: &JsonObject) -> JsonObject {
    let (mut row, version) = system::strip_system_properties(item);
    if let Some(version) = version {
        row.insert(system::VERSION.into(), json!(version));
    }
    row
}

fn error_item_id(error: &TableOperationError) -> Result<String, SyncError> {
    error
        .item_id()
        .map(str::to_string)
        .ok_or_else(|| SyncError::InvalidItem(format!("error for operation '{}' has no item id", error.id)))
}

fn ensure_same_item(item_id: &str, item: &JsonObject) -> Result<(), SyncError> {
    match system::item_id(item) {
        Some(id) if id == item_id => Ok(()),
        other => Err(SyncError::InvalidArgument(format!(
            "resolution item id {other:?} does not match '{item_id}'"
        ))),
    }
}
