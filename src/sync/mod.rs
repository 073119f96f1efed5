//! Push, pull and purge, and the context that runs them.

pub mod context;
pub mod events;
pub mod handler;
pub mod pull;
pub mod purge;
pub mod push;

pub use context::SyncContext;
pub use events::SyncEvent;
pub use handler::{DefaultSyncHandler, ExecuteError, RemoteOperation, SyncHandler};
pub use pull::PullOptions;
pub use purge::PurgeOptions;
pub use push::{OperationBatch, PushCompletionResult, PushStatus};
