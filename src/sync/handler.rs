//! Application hook around push.
//!
//! A [`SyncHandler`] sees every operation before it goes to the server and
//! the final result of each push. The default handler just executes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::push::PushCompletionResult;
use crate::queue::{OperationKind, TableOperation};
use crate::remote::{RemoteError, RemoteTable};
use crate::system::JsonObject;

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Stop the whole push with `CancelledByOperation`.
    #[error("Push aborted by sync handler")]
    Aborted,
    #[error("Operation has no payload to send")]
    MissingItem,
}

/// One queued operation, ready to be sent.
pub struct RemoteOperation<'a> {
    operation: &'a TableOperation,
    table: Arc<dyn RemoteTable>,
}

impl<'a> RemoteOperation<'a> {
    pub(crate) fn new(operation: &'a TableOperation, table: Arc<dyn RemoteTable>) -> Self {
        Self { operation, table }
    }

    pub fn operation(&self) -> &TableOperation {
        self.operation
    }

    /// Payload that will be sent: the current local row without server
    /// metadata, plus `version` for conditional requests.
    pub fn item(&self) -> Option<&JsonObject> {
        self.operation.item.as_ref()
    }

    pub async fn execute(&self) -> Result<Option<JsonObject>, ExecuteError> {
        let item = self.item().cloned().ok_or(ExecuteError::MissingItem)?;
        self.execute_with(item).await
    }

    /// Send a different payload, e.g. after merging a conflict.
    pub async fn execute_with(&self, item: JsonObject) -> Result<Option<JsonObject>, ExecuteError> {
        match self.operation.kind {
            OperationKind::Insert => Ok(self.table.insert(item).await?),
            OperationKind::Update => Ok(self.table.replace(item).await?),
            OperationKind::Delete => match self.table.delete(item).await {
                Ok(()) => Ok(None),
                // Already gone on the server: the local delete is in sync.
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Error to return to abort the push.
    pub fn abort(&self) -> ExecuteError {
        ExecuteError::Aborted
    }
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn execute_table_operation(&self, operation: RemoteOperation<'_>) -> Result<Option<JsonObject>, ExecuteError> {
        operation.execute().await
    }

    /// Called once per push with the final status and the recorded errors.
    /// Errors the handler resolves should be marked handled.
    async fn on_push_complete(&self, _result: &mut PushCompletionResult) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSyncHandler;

impl SyncHandler for DefaultSyncHandler {}
