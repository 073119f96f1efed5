//! Configuration for the sync context.
//!
//! # Example
//!
//! ```
//! use offline_sync::SyncContextConfig;
//!
//! // Defaults
//! let config = SyncContextConfig::default();
//! assert_eq!(config.operation_queue_table, "__operations");
//!
//! // Device-prefixed ids, keep stale errors across restarts
//! let config = SyncContextConfig {
//!     id_prefix: Some("tablet-".into()),
//!     clear_errors_on_initialize: false,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for a [`SyncContext`](crate::SyncContext).
///
/// All fields have defaults; the system table names only need changing when
/// two contexts share one local store.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncContextConfig {
    /// Prefix for ids generated on insert
    #[serde(default)]
    pub id_prefix: Option<String>,

    /// System table holding queued operations
    #[serde(default = "default_operation_queue_table")]
    pub operation_queue_table: String,

    /// System table holding per-item push errors
    #[serde(default = "default_sync_errors_table")]
    pub sync_errors_table: String,

    /// System table holding delta tokens
    #[serde(default = "default_config_table")]
    pub config_table: String,

    /// Wipe error rows left over from a previous session on initialize
    #[serde(default = "default_clear_errors_on_initialize")]
    pub clear_errors_on_initialize: bool,

    /// Buffer of the sync event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_operation_queue_table() -> String { "__operations".to_string() }
fn default_sync_errors_table() -> String { "__errors".to_string() }
fn default_config_table() -> String { "__config".to_string() }
fn default_clear_errors_on_initialize() -> bool { true }
fn default_event_channel_capacity() -> usize { 256 }

impl Default for SyncContextConfig {
    fn default() -> Self {
        Self {
            id_prefix: None,
            operation_queue_table: default_operation_queue_table(),
            sync_errors_table: default_sync_errors_table(),
            config_table: default_config_table(),
            clear_errors_on_initialize: default_clear_errors_on_initialize(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}
