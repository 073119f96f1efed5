// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote table service contract.
//!
//! The engine never speaks HTTP itself. The host application supplies a
//! [`RemoteClient`] that hands out one [`RemoteTable`] per table name; push
//! replays queued operations through it and pull streams changes from it.
//!
//! Failures are reported as [`RemoteError`]. Push classifies them:
//!
//! | Error | Push outcome |
//! |---|---|
//! | `Network`, `Timeout` | batch cancelled (`CancelledByNetworkError`) |
//! | `Http { status: 401 }` | batch cancelled (`CancelledByAuthenticationError`) |
//! | other `Http` (409/412 conflicts, validation) | per-item error, batch continues |
//! | `InvalidResponse` | per-item error, batch continues |

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::system::JsonObject;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Server returned HTTP {status}")]
    Http {
        status: u16,
        /// Raw response body, if any.
        payload: Option<String>,
    },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Http { payload, .. } => payload.as_deref(),
            _ => None,
        }
    }

    /// 409 Conflict or 412 Precondition Failed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self.status(), Some(409 | 412))
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Transport failures: nothing was learned about the item.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// Convenience constructor for a conflict carrying the server's copy.
    #[must_use]
    pub fn conflict(status: u16, server_item: &JsonObject) -> Self {
        Self::Http {
            status,
            payload: Some(Value::Object(server_item.clone()).to_string()),
        }
    }
}

/// Lazily paged query results. Each element is one item as returned by the
/// server; it is not guaranteed to be an object.
pub type ItemStream = BoxStream<'static, Result<Value, RemoteError>>;

#[async_trait]
pub trait RemoteTable: Send + Sync {
    fn name(&self) -> &str;

    /// Create the item. Returns the server's representation, if any.
    async fn insert(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError>;

    /// Replace the item. The `version` field, when present, makes the call
    /// conditional.
    async fn replace(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError>;

    /// Delete the item, conditional on its `version` when present.
    async fn delete(&self, item: JsonObject) -> Result<(), RemoteError>;

    /// Stream items matching an OData query string
    /// (see [`Query::to_odata`](crate::query::Query::to_odata)).
    fn query(&self, odata: &str) -> ItemStream;
}

pub trait RemoteClient: Send + Sync {
    fn table(&self, name: &str) -> Arc<dyn RemoteTable>;
}
