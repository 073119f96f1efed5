// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the offline sync engine.
//!
//! Four families of failure reach the caller:
//!
//! - **Validation**: a create/update/delete that cannot be reconciled with
//!   the queued operation for the same item. The local store and the queue
//!   are untouched.
//! - **Per-item sync errors**: recorded as
//!   [`TableOperationError`](crate::queue::TableOperationError) rows and
//!   reported inside [`SyncError::PushFailed`].
//! - **Batch-fatal push failures**: classified into a
//!   [`PushStatus`](crate::sync::PushStatus), also reported through
//!   [`SyncError::PushFailed`].
//! - **Consistency violations**: pull or purge found the queue in a state
//!   it cannot work with.

use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::StoreError;
use crate::sync::push::PushCompletionResult;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("An insert operation on item '{item_id}' is already in the queue")]
    DuplicateInsert { item_id: String },

    #[error("An insert for item '{item_id}' conflicts with its queued update: the item already exists locally")]
    InsertAfterUpdate { item_id: String },

    #[error("A delete operation on item '{item_id}' is already in the queue")]
    DeleteQueued { item_id: String },

    #[error("The local store is inconsistent with the operation queue for item '{item_id}'; push pending operations first")]
    StoreInconsistent { item_id: String },

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Item '{item_id}' not found in table '{table}'")]
    ItemNotFound { table: String, item_id: String },

    #[error("Item '{item_id}' already exists in table '{table}'")]
    ItemAlreadyExists { table: String, item_id: String },

    #[error("Push failed with status {}: {} unhandled error(s)", .result.status, .result.errors.len())]
    PushFailed {
        result: PushCompletionResult,
        /// Failures that are not tied to a queued operation (store, handler).
        inner_errors: Vec<String>,
    },

    #[error("Table '{table}' still has pending operations")]
    PendingOperations { table: String },

    #[error("Pulled item '{item_id}' of table '{table}' has a pending operation")]
    PendingOperationConflict { table: String, item_id: String },

    #[error("Table '{table}' has pending operations; a filtered purge cannot decide which to keep")]
    ScopedPurgeWithPendingOperations { table: String },

    #[error("Purge of table '{table}' left {remaining} pending operation(s) behind")]
    PurgeIncomplete { table: String, remaining: u64 },

    #[error("Operation '{operation_id}' changed since the error was recorded")]
    OperationChanged { operation_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync context is not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SyncError {
    /// True for errors raised by enqueue-time validation; nothing was written.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateInsert { .. }
                | Self::InsertAfterUpdate { .. }
                | Self::DeleteQueued { .. }
                | Self::StoreInconsistent { .. }
                | Self::InvalidItem(_)
                | Self::ItemNotFound { .. }
                | Self::ItemAlreadyExists { .. }
        )
    }

    /// The push outcome carried by [`SyncError::PushFailed`].
    #[must_use]
    pub fn push_result(&self) -> Option<&PushCompletionResult> {
        match self {
            Self::PushFailed { result, .. } => Some(result),
            _ => None,
        }
    }
}
