// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push: replay queued operations against the server.
//!
//! ```text
//!            ┌──────────── peek(after seq) ◄──────────────┐
//!            ▼                                            │
//!   lock item → load payload → Attempted → remote call ───┤ success: write result, dequeue
//!                                              │          │ per-item failure: Failed + error row
//!                                              ▼
//!                    network / 401 / abort / store failure / cancel
//!                                              │
//!                                              ▼
//!                         stop: status = Cancelled*, queue kept
//! ```
//!
//! Every operation ends a push either removed (replayed), still queued with
//! an error row, or still queued untouched because the batch stopped first.

use std::fmt;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::SyncServices;
use super::events::SyncEvent;
use super::handler::{ExecuteError, RemoteOperation};
use crate::error::SyncError;
use crate::metrics::{self, LatencyTimer};
use crate::query::{Filter, Query};
use crate::queue::{OperationState, TableOperation, TableOperationError};
use crate::system::{self, JsonObject};

/// Terminal classification of one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushStatus {
    Complete,
    CancelledByNetworkError,
    CancelledByAuthenticationError,
    CancelledByOperation,
    CancelledByToken,
    CancelledByOfflineStoreError,
    InternalError,
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "Complete"),
            Self::CancelledByNetworkError => write!(f, "CancelledByNetworkError"),
            Self::CancelledByAuthenticationError => write!(f, "CancelledByAuthenticationError"),
            Self::CancelledByOperation => write!(f, "CancelledByOperation"),
            Self::CancelledByToken => write!(f, "CancelledByToken"),
            Self::CancelledByOfflineStoreError => write!(f, "CancelledByOfflineStoreError"),
            Self::InternalError => write!(f, "InternalError"),
        }
    }
}

/// What a push reports to the sync handler and to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PushCompletionResult {
    pub status: PushStatus,
    pub errors: Vec<TableOperationError>,
}

impl PushCompletionResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == PushStatus::Complete
    }

    pub fn unhandled(&self) -> impl Iterator<Item = &TableOperationError> {
        self.errors.iter().filter(|e| !e.handled)
    }
}

/// State accumulated over one push.
#[derive(Debug, Default)]
pub struct OperationBatch {
    aborted: Option<PushStatus>,
    sync_errors: Vec<TableOperationError>,
    other_errors: Vec<String>,
}

impl OperationBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the batch. The first reason sticks; `Complete` is not a reason.
    pub fn abort(&mut self, reason: PushStatus) {
        if reason == PushStatus::Complete {
            warn!("Ignoring abort with status Complete");
            return;
        }
        self.aborted.get_or_insert(reason);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    #[must_use]
    pub fn status(&self) -> PushStatus {
        self.aborted.unwrap_or(PushStatus::Complete)
    }

    pub fn add_sync_error(&mut self, error: TableOperationError) {
        self.sync_errors.push(error);
    }

    pub fn add_other_error(&mut self, error: impl ToString) {
        self.other_errors.push(error.to_string());
    }

    /// Per-item errors recorded during this batch.
    #[must_use]
    pub fn sync_errors(&self) -> &[TableOperationError] {
        &self.sync_errors
    }

    #[must_use]
    pub fn other_errors(&self) -> &[String] {
        &self.other_errors
    }

    /// Whether the push must be reported as failed, given the error rows
    /// after the handler ran.
    #[must_use]
    pub fn has_errors(&self, errors: &[TableOperationError]) -> bool {
        errors.iter().any(|e| !e.handled) || !self.other_errors.is_empty()
    }
}

fn offline_store_failure(batch: &mut OperationBatch, error: SyncError) -> SyncError {
    batch.abort(PushStatus::CancelledByOfflineStoreError);
    metrics::record_store_error("push");
    error
}

pub(crate) struct PushAction<'a> {
    services: &'a SyncServices,
    /// Tables to push; empty means every table with queued operations.
    tables: Vec<String>,
    token: &'a CancellationToken,
}

impl<'a> PushAction<'a> {
    pub(crate) fn new(services: &'a SyncServices, tables: Vec<String>, token: &'a CancellationToken) -> Self {
        Self { services, tables, token }
    }

    pub(crate) async fn execute(self) -> Result<PushCompletionResult, SyncError> {
        let _timer = LatencyTimer::new("push");
        let mut batch = OperationBatch::new();
        self.services.events.emit(SyncEvent::PushStarted { tables: self.tables.clone() });

        if let Err(e) = self.drain(&mut batch).await {
            warn!(error = %e, "Push stopped");
            batch.add_other_error(&e);
            batch.abort(PushStatus::InternalError);
        }

        let errors = match self.load_errors().await {
            Ok(errors) => errors,
            Err(e) => {
                batch.add_other_error(&e);
                batch.abort(PushStatus::CancelledByOfflineStoreError);
                Vec::new()
            }
        };

        let mut result = PushCompletionResult {
            status: batch.status(),
            errors,
        };
        self.services.handler.on_push_complete(&mut result).await;
        self.services.events.emit(SyncEvent::PushFinished { status: result.status });
        metrics::record_push(&result.status.to_string());

        if result.status != PushStatus::Complete || batch.has_errors(&result.errors) {
            if let Err(e) = self.remove_reported_errors(&result.errors).await {
                batch.add_other_error(&e);
            }
            result.errors.retain(|e| !e.handled);
            warn!(
                status = %result.status,
                unhandled = result.errors.len(),
                recorded = batch.sync_errors().len(),
                "Push failed"
            );
            return Err(SyncError::PushFailed {
                result,
                inner_errors: batch.other_errors,
            });
        }

        info!(status = %result.status, "Push complete");
        Ok(result)
    }

    async fn drain(&self, batch: &mut OperationBatch) -> Result<(), SyncError> {
        let queue = &self.services.queue;
        let tables = if self.tables.is_empty() {
            queue.table_names().await.map_err(|e| offline_store_failure(batch, e))?
        } else {
            self.tables.clone()
        };
        if tables.is_empty() {
            debug!("Nothing to push");
            return Ok(());
        }

        let _table_locks = match queue.lock_tables(&tables, self.token).await {
            Ok(guards) => guards,
            Err(SyncError::Cancelled) => {
                batch.abort(PushStatus::CancelledByToken);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut next = queue.peek(0, &tables).await.map_err(|e| offline_store_failure(batch, e))?;
        while let Some(peeked) = next {
            if self.token.is_cancelled() {
                batch.abort(PushStatus::CancelledByToken);
                break;
            }

            let sequence = peeked.sequence;
            let item_lock = queue.lock_item(&peeked.item_id).await;
            // Re-read under the lock: a collapse may have changed or removed it.
            let current = queue.get_by_id(&peeked.id).await.map_err(|e| offline_store_failure(batch, e))?;
            if let Some(mut operation) = current {
                self.services.events.emit(SyncEvent::ItemWillBePushed {
                    table: operation.table_name.clone(),
                    item_id: operation.item_id.clone(),
                    kind: operation.kind,
                });

                let pushed = self.push_operation(&mut operation, batch).await?;
                if pushed {
                    queue
                        .delete(&operation.id, operation.version)
                        .await
                        .map_err(|e| offline_store_failure(batch, e))?;
                    // A retried operation may have left an error row behind.
                    self.services
                        .store
                        .delete_ids(&self.services.config.sync_errors_table, &[operation.id.clone()])
                        .await
                        .map_err(|e| offline_store_failure(batch, e.into()))?;
                }

                metrics::record_pushed_item(&operation.table_name, if pushed { "success" } else { "error" });
                self.services.events.emit(SyncEvent::ItemWasPushed {
                    table: operation.table_name.clone(),
                    item_id: operation.item_id.clone(),
                    kind: operation.kind,
                    success: pushed,
                });
            }
            drop(item_lock);

            if batch.is_aborted() {
                break;
            }
            next = queue.peek(sequence, &tables).await.map_err(|e| offline_store_failure(batch, e))?;
        }
        Ok(())
    }

    /// Replay one operation. `Ok(true)` means it reached the server and can
    /// be dequeued; `Ok(false)` means it stays queued.
    async fn push_operation(&self, operation: &mut TableOperation, batch: &mut OperationBatch) -> Result<bool, SyncError> {
        let services = self.services;

        let item = match operation.item.take() {
            Some(item) => item,
            None => {
                let loaded = services
                    .store
                    .get_item(&operation.table_name, &operation.item_id)
                    .await
                    .map_err(|e| offline_store_failure(batch, e.into()))?;
                match loaded {
                    Some(item) => item,
                    None => {
                        warn!(
                            table = %operation.table_name,
                            item_id = %operation.item_id,
                            "Queued item missing from local store"
                        );
                        services
                            .queue
                            .set_state(operation, OperationState::Failed)
                            .await
                            .map_err(|e| offline_store_failure(batch, e))?;
                        let mut bare = JsonObject::new();
                        bare.insert(system::ID.into(), json!(operation.item_id));
                        self.record_error(operation, bare, None, None, batch).await?;
                        return Ok(false);
                    }
                }
            }
        };

        if operation.state == OperationState::Pending {
            services
                .queue
                .set_state(operation, OperationState::Attempted)
                .await
                .map_err(|e| offline_store_failure(batch, e))?;
        }

        let (mut payload, version) = system::strip_system_properties(&item);
        if let Some(version) = version {
            payload.insert(system::VERSION.into(), json!(version));
        }
        operation.item = Some(payload.clone());

        if self.token.is_cancelled() {
            batch.abort(PushStatus::CancelledByToken);
            return Ok(false);
        }

        let remote_table = services.remote.table(&operation.table_name);
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = services
                .handler
                .execute_table_operation(RemoteOperation::new(operation, remote_table)) => Some(result),
        };

        match outcome {
            None => {
                batch.abort(PushStatus::CancelledByToken);
                Ok(false)
            }
            Some(Ok(result)) => {
                if operation.writes_result_to_store() {
                    if let Some(server_item) = result.filter(|r| system::item_id(r).is_some()) {
                        services
                            .store
                            .upsert(&operation.table_name, &[server_item], true)
                            .await
                            .map_err(|e| offline_store_failure(batch, e.into()))?;
                    }
                }
                debug!(table = %operation.table_name, item_id = %operation.item_id, kind = %operation.kind, "Pushed operation");
                Ok(true)
            }
            Some(Err(error)) => {
                services
                    .queue
                    .set_state(operation, OperationState::Failed)
                    .await
                    .map_err(|e| offline_store_failure(batch, e))?;

                match error {
                    ExecuteError::Aborted => batch.abort(PushStatus::CancelledByOperation),
                    ExecuteError::Remote(e) if e.is_network() => batch.abort(PushStatus::CancelledByNetworkError),
                    ExecuteError::Remote(e) if e.is_unauthorized() => {
                        batch.abort(PushStatus::CancelledByAuthenticationError)
                    }
                    ExecuteError::Remote(e) => {
                        let raw = e.payload().map(String::from).or_else(|| Some(e.to_string()));
                        self.record_error(operation, payload, e.status(), raw, batch).await?;
                    }
                    ExecuteError::MissingItem => {
                        self.record_error(operation, payload, None, None, batch).await?;
                    }
                }
                Ok(false)
            }
        }
    }

    async fn record_error(
        &self,
        operation: &TableOperation,
        item: JsonObject,
        status: Option<u16>,
        raw_result: Option<String>,
        batch: &mut OperationBatch,
    ) -> Result<(), SyncError> {
        let error = TableOperationError::new(operation, item, status, raw_result);
        debug!(
            table = %error.table_name,
            operation_id = %error.id,
            status = ?error.status,
            "Recorded push error"
        );
        self.services
            .store
            .upsert(&self.services.config.sync_errors_table, &[error.to_record()], false)
            .await
            .map_err(|e| offline_store_failure(batch, e.into()))?;
        batch.add_sync_error(error);
        Ok(())
    }

    async fn load_errors(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let mut query = Query::new(&self.services.config.sync_errors_table);
        if let Some(in_tables) = Filter::any_of("tableName", self.tables.iter().cloned()) {
            query = query.with_filter(in_tables);
        }
        self.services
            .store
            .query(&query)
            .await?
            .iter()
            .map(|record| TableOperationError::from_record(record).map_err(SyncError::from))
            .collect()
    }

    /// Errors are reported once; only conflicts stay until resolved.
    async fn remove_reported_errors(&self, errors: &[TableOperationError]) -> Result<(), SyncError> {
        let ids: Vec<String> = errors
            .iter()
            .filter(|e| !e.is_conflict())
            .map(|e| e.id.clone())
            .collect();
        if !ids.is_empty() {
            self.services
                .store
                .delete_ids(&self.services.config.sync_errors_table, &ids)
                .await?;
        }
        Ok(())
    }
}
