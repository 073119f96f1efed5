//! The persisted operation queue.

pub mod locks;
pub mod operation;
pub mod operation_error;
pub mod operations_queue;

pub use locks::{LockMap, NamedLockGuard};
pub use operation::{OperationKind, OperationState, TableOperation};
pub use operation_error::TableOperationError;
pub use operations_queue::{EnqueueOutcome, OperationsQueue};
