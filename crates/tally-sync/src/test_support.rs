//! In-process fakes of the Cloud and POS collaborators, with call counters
//! and failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use tally_core::LowStockAlert;
use tally_db::{Database, DbConfig};

use crate::cloud::{CloudBackend, CloudFilter, Deletion, SYNCED_AT};
use crate::error::{SyncError, SyncResult};
use crate::events::{AuditEvent, SyncEventEmitter};
use crate::pos::{PosCollection, PosPage, PosPlatform};
use crate::status::EngineStatus;

pub const TENANT: &str = "shop-1";

pub async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

fn timestamp(row: &Value, field: &str) -> Option<DateTime<Utc>> {
    row.get(field)
        .cloned()
        .and_then(|v| serde_json::from_value::<Option<DateTime<Utc>>>(v).ok())
        .flatten()
}

fn text(row: &Value, field: &str) -> String {
    row.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// Fake Cloud
// =============================================================================

/// A stored row and the backend's write stamp for it.
struct StoredRow {
    row: Value,
    synced_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct FakeCloud {
    /// table → (tenant_id, local_id) → row
    tables: Mutex<HashMap<String, BTreeMap<(String, String), StoredRow>>>,
    /// Server clock in seconds; advances one tick per written row.
    clock: AtomicI64,
    upserts: AtomicUsize,
    selects: AtomicUsize,
    pings: AtomicUsize,
    upsert_failures: Mutex<HashMap<usize, SyncError>>,
    offline: AtomicBool,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `n`th upsert call (1-based) fail with `error`.
    pub fn fail_upsert_call(&self, n: usize, error: SyncError) {
        self.upsert_failures.lock().unwrap().insert(n, error);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes `row` as another device's upsert would, stamping `synced_at`
    /// from the server clock.
    pub fn insert_row(&self, table: &str, row: Value) {
        let key = (text(&row, "tenant_id"), text(&row, "local_id"));
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let synced_at = Utc
            .timestamp_opt(1_800_000_000 + tick, 0)
            .single()
            .unwrap();
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key, StoredRow { row, synced_at });
    }

    pub fn row(&self, table: &str, local_id: &str) -> Option<Value> {
        self.stored(table, local_id, |stored| stored.row.clone())
    }

    pub fn synced_at(&self, table: &str, local_id: &str) -> Option<DateTime<Utc>> {
        self.stored(table, local_id, |stored| stored.synced_at)
    }

    fn stored<R>(&self, table: &str, local_id: &str, f: impl Fn(&StoredRow) -> R) -> Option<R> {
        self.tables.lock().unwrap().get(table).and_then(|rows| {
            rows.iter()
                .find(|((_, id), _)| id == local_id)
                .map(|(_, stored)| f(stored))
        })
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn select_calls(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.upsert_calls() + self.select_calls() + self.pings.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudBackend for FakeCloud {
    async fn upsert(&self, table: &str, rows: &[Value]) -> SyncResult<()> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_online()?;
        if let Some(error) = self.upsert_failures.lock().unwrap().remove(&call) {
            return Err(error);
        }
        for row in rows {
            self.insert_row(table, row.clone());
        }
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        tenant_id: &str,
        filter: &CloudFilter,
    ) -> SyncResult<Vec<Value>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|((tenant, _), _)| tenant == tenant_id)
                    .filter(|(_, stored)| {
                        let deleted = timestamp(&stored.row, "deleted_at").is_some();
                        match &filter.deletion {
                            Deletion::Live => !deleted,
                            Deletion::Tombstones { synced_since } => {
                                deleted && synced_since.map_or(true, |since| stored.synced_at >= since)
                            }
                        }
                    })
                    .map(|(_, stored)| {
                        let mut row = stored.row.clone();
                        if let Value::Object(ref mut map) = row {
                            map.insert(SYNCED_AT.to_string(), serde_json::json!(stored.synced_at));
                        }
                        row
                    })
                    .filter(|row| {
                        filter
                            .local_id
                            .as_deref()
                            .map_or(true, |id| text(row, "local_id") == id)
                    })
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by_key(|row| (timestamp(row, "updated_at"), text(row, "local_id")));
        Ok(rows)
    }

    async fn ping(&self) -> SyncResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check_online()
    }
}

// =============================================================================
// Fake POS
// =============================================================================

pub struct FakePos {
    objects: Mutex<HashMap<PosCollection, BTreeMap<String, Value>>>,
    page_size: usize,
    lists: AtomicUsize,
    fetches: AtomicUsize,
}

impl FakePos {
    pub fn new() -> Self {
        FakePos {
            objects: Mutex::new(HashMap::new()),
            page_size: 2,
            lists: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, collection: PosCollection, object: Value) {
        let id = text(&object, "id");
        self.objects
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .insert(id, object);
    }

    pub fn remove(&self, collection: PosCollection, id: &str) {
        if let Some(objects) = self.objects.lock().unwrap().get_mut(&collection) {
            objects.remove(id);
        }
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PosPlatform for FakePos {
    async fn list(&self, collection: PosCollection, cursor: Option<&str>) -> SyncResult<PosPage> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let objects = self.objects.lock().unwrap();
        let all: Vec<Value> = objects
            .get(&collection)
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default();

        let end = (start + self.page_size).min(all.len());
        Ok(PosPage {
            objects: all[start.min(end)..end].to_vec(),
            cursor: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn fetch(&self, collection: PosCollection, id: &str) -> SyncResult<Option<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&collection)
            .and_then(|o| o.get(id).cloned()))
    }

    async fn ping(&self) -> SyncResult<()> {
        Ok(())
    }
}

// =============================================================================
// Recording Emitter
// =============================================================================

#[derive(Default)]
pub struct RecordingEmitter {
    pub low_stock: Mutex<Vec<LowStockAlert>>,
    pub audits: Mutex<Vec<AuditEvent>>,
    pub statuses: Mutex<Vec<EngineStatus>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit_status(&self, status: &EngineStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }

    fn emit_low_stock(&self, alert: &LowStockAlert) {
        self.low_stock.lock().unwrap().push(alert.clone());
    }

    fn emit_audit(&self, event: &AuditEvent) {
        self.audits.lock().unwrap().push(event.clone());
    }

    fn emit_error(&self, message: &str, _retryable: bool) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}
