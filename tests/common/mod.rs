//! Shared fixtures for the integration tests: a scripted in-memory server.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use offline_sync::system::{self, format_timestamp};
use offline_sync::{ItemStream, JsonObject, RemoteClient, RemoteError, RemoteTable};

pub fn obj(v: Value) -> JsonObject {
    v.as_object().cloned().expect("test item must be an object")
}

/// One remote call as the server saw it.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub item: JsonObject,
}

/// A server table with version checks, tombstones, and scripted failures.
pub struct MockTable {
    name: String,
    clock: Arc<AtomicI64>,
    offline: Arc<AtomicBool>,
    rows: Mutex<BTreeMap<String, JsonObject>>,
    calls: Mutex<Vec<Call>>,
    queries: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
}

impl MockTable {
    fn new(name: &str, clock: Arc<AtomicI64>, offline: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_string(),
            clock,
            offline,
            rows: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn tick(&self) -> String {
        let millis = self.clock.fetch_add(1000, Ordering::SeqCst) + 1000;
        let ts = DateTime::<Utc>::from_timestamp_millis(millis).expect("valid clock");
        format_timestamp(ts)
    }

    /// Stamp and store a row as if another client had written it.
    pub fn seed(&self, item: JsonObject) -> JsonObject {
        let id = system::item_id(&item).expect("seeded item needs an id").to_string();
        let mut row = item;
        let version = self
            .rows
            .lock()
            .get(&id)
            .and_then(system::item_version)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        row.insert(system::VERSION.into(), json!(version.to_string()));
        row.insert(system::UPDATED_AT.into(), json!(self.tick()));
        row.entry(system::DELETED).or_insert(json!(false));
        self.rows.lock().insert(id, row.clone());
        row
    }

    /// Tombstone a row as if another client had deleted it.
    pub fn seed_delete(&self, id: &str) {
        let mut row = self.row(id).expect("row to tombstone");
        row.insert(system::DELETED.into(), json!(true));
        self.seed(row);
    }

    pub fn row(&self, id: &str) -> Option<JsonObject> {
        self.rows.lock().get(id).cloned()
    }

    pub fn live_rows(&self) -> usize {
        self.rows.lock().values().filter(|r| !system::is_deleted(r)).count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// Fail the next call touching `item_id` with `error`.
    pub fn fail_next(&self, item_id: &str, error: RemoteError) {
        self.failures.lock().entry(item_id.to_string()).or_default().push_back(error);
    }

    fn enter(&self, method: &'static str, item: &JsonObject) -> Result<String, RemoteError> {
        self.calls.lock().push(Call {
            method,
            item: item.clone(),
        });
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".into()));
        }
        let id = system::item_id(item)
            .ok_or_else(|| RemoteError::Http { status: 400, payload: None })?
            .to_string();
        if let Some(error) = self.failures.lock().get_mut(&id).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(id)
    }

    fn check_version(&self, id: &str, item: &JsonObject) -> Result<JsonObject, RemoteError> {
        let current = self
            .row(id)
            .filter(|r| !system::is_deleted(r))
            .ok_or(RemoteError::Http { status: 404, payload: None })?;
        match system::item_version(item) {
            Some(v) if Some(&v) != system::item_version(&current).as_ref() => Err(RemoteError::conflict(412, &current)),
            _ => Ok(current),
        }
    }
}

#[async_trait]
impl RemoteTable for MockTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError> {
        let id = self.enter("insert", &item)?;
        if let Some(existing) = self.row(&id).filter(|r| !system::is_deleted(r)) {
            return Err(RemoteError::conflict(409, &existing));
        }
        let (row, _) = system::strip_system_properties(&item);
        Ok(Some(self.seed(row)))
    }

    async fn replace(&self, item: JsonObject) -> Result<Option<JsonObject>, RemoteError> {
        let id = self.enter("replace", &item)?;
        self.check_version(&id, &item)?;
        let (row, _) = system::strip_system_properties(&item);
        Ok(Some(self.seed(row)))
    }

    async fn delete(&self, item: JsonObject) -> Result<(), RemoteError> {
        let id = self.enter("delete", &item)?;
        self.check_version(&id, &item)?;
        self.seed_delete(&id);
        Ok(())
    }

    fn query(&self, odata: &str) -> ItemStream {
        self.queries.lock().push(odata.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Box::pin(futures::stream::once(async { Err(RemoteError::Timeout) }));
        }

        let after = watermark(odata);
        let include_deleted = odata.contains("__includedeleted=true");
        let mut rows: Vec<JsonObject> = self
            .rows
            .lock()
            .values()
            .filter(|r| include_deleted || !system::is_deleted(r))
            .filter(|r| match (after, system::updated_at(r)) {
                (Some(after), Some(ts)) => ts > after,
                _ => true,
            })
            .cloned()
            .collect();
        rows.sort_by_key(system::updated_at);
        Box::pin(futures::stream::iter(rows.into_iter().map(|r| Ok(Value::Object(r)))))
    }
}

/// The `updatedAt gt <ts>` bound of an incremental query.
fn watermark(odata: &str) -> Option<DateTime<Utc>> {
    let start = odata.find("updatedAt gt cast(")? + "updatedAt gt cast(".len();
    let end = start + odata[start..].find(",Edm.DateTimeOffset")?;
    DateTime::parse_from_rfc3339(&odata[start..end]).ok().map(|dt| dt.with_timezone(&Utc))
}

/// A server of [`MockTable`]s sharing one clock.
pub struct MockRemote {
    tables: DashMap<String, Arc<MockTable>>,
    clock: Arc<AtomicI64>,
    offline: Arc<AtomicBool>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
            // 2026-01-01T00:00:00Z
            clock: Arc::new(AtomicI64::new(1_767_225_600_000)),
            offline: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn mock_table(&self, name: &str) -> Arc<MockTable> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockTable::new(name, self.clock.clone(), self.offline.clone())))
            .clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn total_calls(&self) -> usize {
        self.tables.iter().map(|t| t.calls().len()).sum()
    }
}

impl RemoteClient for MockRemote {
    fn table(&self, name: &str) -> Arc<dyn RemoteTable> {
        self.mock_table(name)
    }
}
