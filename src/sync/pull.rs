// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull: incremental fetch of server changes into the local store.
//!
//! Each `(table, query id)` pair has a delta token, the newest `updatedAt`
//! already applied. A pull asks the server for items of the query updated
//! after the token, tombstones included, oldest first. Every applied item
//! advances and persists the token, so an interrupted pull resumes where it
//! stopped.
//!
//! A table with queued operations is never pulled into: local intent would
//! be overwritten by server state. The pull pushes first and gives up if the
//! table is still dirty afterwards.

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::SyncServices;
use super::events::SyncEvent;
use super::push::PushAction;
use crate::error::SyncError;
use crate::metrics::{self, LatencyTimer};
use crate::query::{Filter, Query};
use crate::queue::NamedLockGuard;
use crate::system;

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Key of the delta token; derived from the query when absent.
    pub query_id: Option<String>,
    /// When the table is dirty, push every table instead of just this one.
    pub push_other_tables: bool,
}

pub(crate) struct PullAction<'a> {
    services: &'a SyncServices,
    query: Query,
    query_id: String,
    push_other_tables: bool,
    token: &'a CancellationToken,
}

impl<'a> PullAction<'a> {
    pub(crate) fn new(
        services: &'a SyncServices,
        query: Query,
        query_id: String,
        push_other_tables: bool,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            services,
            query,
            query_id,
            push_other_tables,
            token,
        }
    }

    /// Returns the number of items applied.
    pub(crate) async fn execute(self) -> Result<u64, SyncError> {
        let _timer = LatencyTimer::new("pull");
        let queue = &self.services.queue;
        let table = self.query.table.clone();
        let mut push_error = None;

        for attempt in 0..2 {
            let guard = queue.lock_table(&table, self.token).await?;
            let pending = queue.count_pending(&table).await?;
            if pending == 0 {
                return self.pull_locked(guard).await;
            }
            // Push takes the table lock itself.
            drop(guard);

            if attempt == 0 {
                info!(table = %table, pending, "Table has pending operations, pushing before pull");
                let tables = if self.push_other_tables { Vec::new() } else { vec![table.clone()] };
                if let Err(e) = PushAction::new(self.services, tables, self.token).execute().await {
                    push_error = Some(e);
                }
            }
        }

        warn!(table = %table, "Pull skipped: table still has pending operations after push");
        Err(push_error.unwrap_or(SyncError::PendingOperations { table }))
    }

    async fn pull_locked(&self, _table_lock: NamedLockGuard) -> Result<u64, SyncError> {
        let events = &self.services.events;
        let table = self.query.table.clone();
        events.emit(SyncEvent::PullStarted {
            table: table.clone(),
            query_id: self.query_id.clone(),
        });

        let mut applied = 0;
        let result = self.apply_changes(&mut applied).await;

        events.emit(SyncEvent::PullFinished {
            table: table.clone(),
            query_id: self.query_id.clone(),
            items: applied,
            success: result.is_ok(),
        });
        match &result {
            Ok(()) => info!(table = %table, query_id = %self.query_id, items = applied, "Pull complete"),
            Err(e) => warn!(table = %table, query_id = %self.query_id, items = applied, error = %e, "Pull failed"),
        }
        result.map(|()| applied)
    }

    async fn apply_changes(&self, applied: &mut u64) -> Result<(), SyncError> {
        let services = self.services;
        let table = &self.query.table;

        let mut watermark = services.delta_tokens.get(table, &self.query_id).await?;
        let query = self
            .query
            .clone()
            .with_filter(Filter::gt(system::UPDATED_AT, system::format_timestamp(watermark)));
        let odata = query.to_odata(Some(system::UPDATED_AT), true);
        debug!(table = %table, query_id = %self.query_id, odata = %odata, "Requesting changes");

        let mut stream = services.remote.table(table).query(&odata);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(SyncError::Cancelled),
                next = stream.next() => next,
            };
            let Some(next) = next else { break };

            let Value::Object(item) = next? else {
                return Err(SyncError::InvalidItem(format!("pulled item of table '{table}' is not a JSON object")));
            };
            let item_id = system::item_id(&item)
                .ok_or_else(|| SyncError::InvalidItem(format!("pulled item of table '{table}' has no id")))?
                .to_string();

            // The table was clean when the pull began; an operation now means
            // the application wrote the item concurrently. The item lock keeps
            // a new one out until the server copy is stored.
            let item_lock = services.queue.lock_item(&item_id).await;
            if services.queue.get_by_item_id(table, &item_id).await?.is_some() {
                return Err(SyncError::PendingOperationConflict {
                    table: table.clone(),
                    item_id,
                });
            }

            services.events.emit(SyncEvent::ItemWillBeStored {
                table: table.clone(),
                item_id: item_id.clone(),
            });

            let deleted = system::is_deleted(&item);
            let updated_at = system::updated_at(&item);
            if deleted {
                services.store.delete_ids(table, &[item_id.clone()]).await?;
            } else {
                services.store.upsert(table, &[item], true).await?;
            }
            drop(item_lock);

            if let Some(updated_at) = updated_at.filter(|ts| *ts > watermark) {
                services.delta_tokens.set(table, &self.query_id, updated_at).await?;
                watermark = updated_at;
            }

            *applied += 1;
            metrics::record_pulled_item(table, if deleted { "delete" } else { "upsert" });
            services.events.emit(SyncEvent::ItemWasStored {
                table: table.clone(),
                item_id,
                deleted,
            });
        }
        Ok(())
    }
}
