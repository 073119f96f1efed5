//! # Offline Sync
//!
//! An offline-first sync engine for table-shaped JSON data.
//!
//! Applications read and write a local store. Every write is applied locally
//! at once and recorded as an operation in a persisted queue; a later push
//! replays the queue against the server. Pulls fetch server changes
//! incrementally and purges drop local data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SyncContext                          │
//! │  • insert / replace / delete: local write + enqueue         │
//! │  • push / pull / purge                                      │
//! │  • error resolution, events                                 │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌───────────────────────────┐     ┌─────────────────────────────┐
//! │     OperationsQueue       │     │        RemoteClient         │
//! │  • one op per item        │     │  • insert / replace / delete│
//! │  • collapse on enqueue    │     │  • OData query stream       │
//! │  • item / table locks     │     └─────────────────────────────┘
//! └───────────────────────────┘
//!              │
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LocalStore                           │
//! │  • application tables                                       │
//! │  • __operations, __errors, __config system tables           │
//! │  • InMemoryStore or SqliteStore                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{Query, PullOptions, RemoteClient, SqliteStore, SyncContext, SyncContextConfig};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(remote: Arc<dyn RemoteClient>) -> Result<(), offline_sync::SyncError> {
//! let store = Arc::new(SqliteStore::open("todo.db").await?);
//! let context = SyncContext::new(SyncContextConfig::default(), store, remote);
//!
//! let sample = json!({"title": "", "done": false}).as_object().cloned().unwrap_or_default();
//! context.define_table("todo", &sample).await?;
//!
//! let token = CancellationToken::new();
//! context.pull(Query::new("todo"), PullOptions::default(), &token).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: [`SyncContext`] and the push, pull and purge actions
//! - [`queue`]: the persisted operation queue and its collapse rules
//! - [`storage`]: local stores (memory, SQLite)
//! - [`remote`]: the server-side collaborator traits
//! - [`delta_token`]: per-query pull watermarks
//! - [`query`]: filters, OData rendering, query ids
//! - [`resilience`]: retry with backoff

pub mod config;
pub mod delta_token;
pub mod error;
pub mod metrics;
pub mod query;
pub mod queue;
pub mod remote;
pub mod resilience;
pub mod storage;
pub mod sync;
pub mod system;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::SyncContextConfig;
pub use delta_token::{DeltaTokenStore, StoreDeltaTokens};
pub use error::SyncError;
pub use metrics::LatencyTimer;
pub use query::{query_id, Filter, Query};
pub use queue::{OperationKind, OperationState, TableOperation, TableOperationError};
pub use remote::{ItemStream, RemoteClient, RemoteError, RemoteTable};
pub use resilience::retry::RetryConfig;
pub use storage::{InMemoryStore, LocalStore, SqliteStore, StoreError};
pub use sync::{
    DefaultSyncHandler, ExecuteError, PullOptions, PurgeOptions, PushCompletionResult, PushStatus, RemoteOperation,
    SyncContext, SyncEvent, SyncHandler,
};
pub use system::JsonObject;
