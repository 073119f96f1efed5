// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Opening a SQLite local store and a sync context
//! 2. Writing items while "offline"
//! 3. A failed push, then a successful one
//! 4. Pulling changes made by another client
//! 5. Resolving a version conflict
//! 6. Displaying metrics
//!
//! The server is an in-process stand-in; a real application would wrap its
//! HTTP client in [`RemoteTable`].
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashMap;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use offline_sync::system::{self, format_timestamp};
use offline_sync::{
    ItemStream, JsonObject, PullOptions, Query, RemoteClient, RemoteError, RemoteTable, SqliteStore, SyncContext,
    SyncContextConfig, SyncError,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Single-table server with versions and `updatedAt` stamps.
struct DemoServer {
    rows: DashMap<String, JsonObject>,
    clock: AtomicI64,
    online: AtomicBool,
}

impl DemoServer {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
            clock: AtomicI64::new(1_767_225_600_000),
            online: AtomicBool::new(true),
        }
    }

    fn write(&self, item: JsonObject) -> JsonObject {
        let (mut row, _) = system::strip_system_properties(&item);
        let id = system::item_id(&row).unwrap_or_default().to_string();
        let version = self
            .rows
            .get(&id)
            .and_then(|r| system::item_version(&r))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let millis = self.clock.fetch_add(1000, Ordering::SeqCst) + 1000;
        let stamp = DateTime::from_timestamp_millis(millis).map(format_timestamp);
        row.insert("version".into(), json!(version.to_string()));
        row.insert("updatedAt".into(), json!(stamp));
        row.insert("deleted".into(), json!(false));
        self.rows.insert(id, row.clone());
        row
    }

    fn reachable(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("no route to host".into()))
        }
    }
}

#[async_trait]
impl RemoteTable for DemoServer {
    fn name(&self) -> &str {
        "todo"
    }

    async fn insert(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError> {
        self.reachable()?;
        Ok(Some(self.write(item)))
    }

    async fn replace(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError> {
        self.reachable()?;
        let id = system::item_id(&item).unwrap_or_default().to_string();
        if let Some(current) = self.rows.get(&id).map(|r| r.clone()) {
            if system::item_version(&item).is_some_and(|v| Some(v) != system::item_version(&current)) {
                return Err(RemoteError::conflict(412, &current));
            }
        }
        Ok(Some(self.write(item)))
    }

    async fn delete(&self, item: JsonObject) -> Result<(), RemoteError> {
        self.reachable()?;
        let id = system::item_id(&item).unwrap_or_default().to_string();
        if let Some(mut row) = self.rows.get(&id).map(|r| r.clone()) {
            row.insert("deleted".into(), json!(true));
            let mut tombstone = self.write(row);
            tombstone.insert("deleted".into(), json!(true));
            self.rows.insert(id, tombstone);
        }
        Ok(())
    }

    fn query(&self, _odata: &str) -> ItemStream {
        // Ignores the filter; re-applying rows already pulled is harmless.
        let mut rows: Vec<JsonObject> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(system::updated_at);
        Box::pin(futures::stream::iter(rows.into_iter().map(|r| Ok(Value::Object(r)))))
    }
}

struct DemoClient(Arc<DemoServer>);

impl RemoteClient for DemoClient {
    fn table(&self, _name: &str) -> Arc<dyn RemoteTable> {
        self.0.clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Local store and context
    // ─────────────────────────────────────────────────────────────────────────
    let dir = std::env::temp_dir().join("offline-sync-demo");
    std::fs::create_dir_all(&dir)?;
    let db = dir.join("todo.db");
    let _ = std::fs::remove_file(&db);

    let server = Arc::new(DemoServer::new());
    let store = Arc::new(SqliteStore::open(&db).await?);
    let context = SyncContext::new(SyncContextConfig::default(), store.clone(), Arc::new(DemoClient(server.clone())));
    let sample = json!({"title": "", "done": false}).as_object().cloned().unwrap_or_default();
    context.define_table("todo", &sample).await?;
    println!("📂 Local store at {}", db.display());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Offline writes
    // ─────────────────────────────────────────────────────────────────────────
    server.online.store(false, Ordering::SeqCst);
    let token = CancellationToken::new();
    for title in ["buy milk", "walk dog", "file taxes"] {
        let item = json!({"title": title, "done": false}).as_object().cloned().unwrap_or_default();
        let saved = context.insert_item("todo", item).await?;
        println!("  ✏️  inserted {} ({})", saved["id"], title);
    }
    println!("📋 {} operations queued", context.pending_operations().await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Push: fails offline, succeeds online
    // ─────────────────────────────────────────────────────────────────────────
    if let Err(SyncError::PushFailed { result, .. }) = context.push(&[], &token).await {
        println!("📡 push while offline: {}", result.status);
    }
    server.online.store(true, Ordering::SeqCst);
    let result = context.push(&[], &token).await?;
    println!("📡 push online: {} ({} left queued)", result.status, context.pending_operations().await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Pull changes made by another client
    // ─────────────────────────────────────────────────────────────────────────
    server.write(json!({"id": "shared", "title": "from the web app", "done": true}).as_object().cloned().unwrap_or_default());
    let pulled = context.pull(Query::new("todo"), PullOptions::default(), &token).await?;
    println!("⬇️  pulled {pulled} items, {} rows locally", context.count_items(&Query::new("todo")).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Conflict and resolution
    // ─────────────────────────────────────────────────────────────────────────
    server.write(json!({"id": "shared", "title": "edited on the web", "done": true}).as_object().cloned().unwrap_or_default());
    let mine = json!({"id": "shared", "title": "edited here", "done": false}).as_object().cloned().unwrap_or_default();
    context.replace_item("todo", mine).await?;

    match context.push(&[], &token).await {
        Err(SyncError::PushFailed { mut result, .. }) => {
            for error in &mut result.errors {
                println!("⚠️  conflict on {:?} (HTTP {:?})", error.item_id(), error.status);
                if let Some(server_copy) = error.result.clone() {
                    let mut merged = server_copy;
                    merged.insert("title".into(), json!("edited here, merged"));
                    context.update_operation(error, merged).await?;
                }
            }
            context.push(&[], &token).await?;
            println!("✅ conflict resolved, server now has {}", server.rows.get("shared").map(|r| r["title"].clone()).unwrap_or_default());
        }
        Err(e) => return Err(e.into()),
        Ok(_) => println!("no conflict this time"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics");
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        let value = match value {
            DebugValue::Counter(c) => c.to_string(),
            DebugValue::Gauge(g) => format!("{}", g.into_inner()),
            DebugValue::Histogram(h) => format!("{} samples", h.len()),
        };
        println!("  {} = {}", key.key().name(), value);
    }

    store.close().await;
    Ok(())
}
