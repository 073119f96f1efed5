//! Purge: drop local rows of a table (or of a query over it) and forget the
//! matching delta tokens so the next pull starts from scratch.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::SyncServices;
use crate::error::SyncError;
use crate::metrics::{self, LatencyTimer};
use crate::query::Query;

#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Delta token to reset; derived from the query when absent.
    pub query_id: Option<String>,
    /// Drop queued operations in the purge scope instead of refusing.
    pub discard_pending_operations: bool,
}

pub(crate) struct PurgeAction<'a> {
    services: &'a SyncServices,
    query: Query,
    query_id: String,
    discard_pending_operations: bool,
    token: &'a CancellationToken,
}

impl<'a> PurgeAction<'a> {
    pub(crate) fn new(
        services: &'a SyncServices,
        query: Query,
        query_id: String,
        discard_pending_operations: bool,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            services,
            query,
            query_id,
            discard_pending_operations,
            token,
        }
    }

    /// Returns the number of local rows removed.
    pub(crate) async fn execute(self) -> Result<u64, SyncError> {
        let _timer = LatencyTimer::new("purge");
        let services = self.services;
        let table = self.query.table.clone();
        let scoped = self.query.filter.is_some();

        let _table_lock = services.queue.lock_table(&table, self.token).await?;

        let mut discarded = 0;
        let pending = services.queue.count_pending(&table).await?;
        if pending > 0 {
            if !self.discard_pending_operations {
                warn!(table = %table, pending, scoped, "Purge refused: table has pending operations");
                return Err(if scoped {
                    SyncError::ScopedPurgeWithPendingOperations { table }
                } else {
                    SyncError::PendingOperations { table }
                });
            }

            let removed = services.queue.delete_by_query(&self.query).await?;
            let ids: Vec<String> = removed.iter().map(|op| op.id.clone()).collect();
            services
                .store
                .delete_ids(&services.config.sync_errors_table, &ids)
                .await?;
            discarded = ids.len() as u64;
        }

        if self.token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Local writes queue under the write lock too, so nothing can be
        // queued between this check and the delete.
        let writes = services.queue.hold_writes().await;
        if self.discard_pending_operations {
            let remaining = services.queue.in_scope(&self.query).await?.len() as u64;
            if remaining > 0 {
                return Err(SyncError::PurgeIncomplete { table, remaining });
            }
        } else if services.queue.count_pending(&table).await? > 0 {
            warn!(table = %table, scoped, "Purge refused: operation queued during purge");
            return Err(if scoped {
                SyncError::ScopedPurgeWithPendingOperations { table }
            } else {
                SyncError::PendingOperations { table }
            });
        }

        if scoped {
            services.delta_tokens.reset(&table, &self.query_id).await?;
        } else {
            services.delta_tokens.reset_table(&table).await?;
        }
        let rows = services.store.delete_query(&self.query).await?;
        drop(writes);

        metrics::record_purge(&table, rows, discarded);
        info!(table = %table, query_id = %self.query_id, rows, discarded, "Purge complete");
        Ok(rows)
    }
}
