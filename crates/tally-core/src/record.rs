//! # Syncable Record Contract
//!
//! The data contract every synced entity implements.
//!
//! ## Three Stores, One Record
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Identity Across Stores                             │
//! │                                                                         │
//! │   Local store            Cloud backend            POS platform          │
//! │   ───────────            ─────────────            ────────────          │
//! │   local_id  ◄──────────► local_id (upsert key)                          │
//! │   external_ref ◄───────► external_ref ◄─────────► object id            │
//! │   tenant_id ◄──────────► tenant_id (partition)                          │
//! │   updated_at ◄─────────► updated_at   (sole conflict signal)           │
//! │   deleted_at ◄─────────► deleted_at   (tombstone)                      │
//! │   sync_status            -                        -                     │
//! │   sync_attempts          -                        -                     │
//! │                                                                         │
//! │   local_id is the ONLY key stable across all three stores.             │
//! │   external_ref may be absent, or dangle (POS object deleted).          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entities embed [`SyncMeta`] with `#[serde(flatten)]`, so the Cloud row
//! and the stored payload are a single flat JSON object. The local-only
//! bookkeeping columns are stripped before a row leaves the device
//! ([`to_cloud_row`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;
use crate::validation::ValidationResult;

// =============================================================================
// Entity Kind
// =============================================================================

/// The five synced domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EntityKind {
    Customer,
    InventoryItem,
    Payment,
    Employee,
    Ticket,
}

impl EntityKind {
    /// Orchestrator order. Tickets and payments reference customers, so
    /// customers go first.
    pub const SYNC_ORDER: [EntityKind; 5] = [
        EntityKind::Customer,
        EntityKind::InventoryItem,
        EntityKind::Ticket,
        EntityKind::Payment,
        EntityKind::Employee,
    ];

    /// Stable identifier used in the local store and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::InventoryItem => "inventory_item",
            EntityKind::Payment => "payment",
            EntityKind::Employee => "employee",
            EntityKind::Ticket => "ticket",
        }
    }

    /// Cloud table holding this domain.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::InventoryItem => "inventory_items",
            EntityKind::Payment => "payments",
            EntityKind::Employee => "employees",
            EntityKind::Ticket => "tickets",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(EntityKind::Customer),
            "inventory_item" => Ok(EntityKind::InventoryItem),
            "payment" => Ok(EntityKind::Payment),
            "employee" => Ok(EntityKind::Employee),
            "ticket" => Ok(EntityKind::Ticket),
            other => Err(CoreError::UnknownEntityKind(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Persisted per-record sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncStatus {
    /// Local changes not yet confirmed by the Cloud backend.
    #[default]
    Pending,
    /// Local copy matches what was last pushed or pulled.
    Synced,
    /// Parked after a record-fatal error or an exhausted retry budget.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(CoreError::UnknownSyncStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Local-only columns, never sent to the Cloud backend.
pub const BOOKKEEPING_FIELDS: [&str; 4] = [
    "sync_status",
    "sync_attempts",
    "next_attempt_at",
    "last_sync_error",
];

/// Sync bookkeeping shared by every entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncMeta {
    /// Stable local identifier (UUID v4). Never reused, never changed.
    pub local_id: String,

    /// POS object id, when the record came from or was matched to POS.
    #[serde(default)]
    pub external_ref: Option<String>,

    /// Cloud partition ("shop id").
    #[serde(default)]
    pub tenant_id: String,

    /// Last modification time; the only conflict signal.
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    /// Tombstone.
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Record-level upload failures since the last success.
    #[serde(default)]
    pub sync_attempts: u32,

    /// Earliest time the next upload may be attempted.
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_sync_error: Option<String>,
}

impl SyncMeta {
    /// Metadata for a record created on this device.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        SyncMeta::with_id(Uuid::new_v4().to_string(), tenant_id, Utc::now())
    }

    /// Metadata with an explicit id and timestamp, status `pending`.
    pub fn with_id(
        local_id: impl Into<String>,
        tenant_id: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        SyncMeta {
            local_id: local_id.into(),
            external_ref: None,
            tenant_id: tenant_id.into(),
            updated_at,
            deleted_at: None,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            next_attempt_at: None,
            last_sync_error: None,
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the local copy carries edits the Cloud has not confirmed.
    #[inline]
    pub fn has_local_changes(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }

    /// Whether backoff allows an upload attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sync_status == SyncStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Records a local mutation: stamp, mark pending, fresh retry budget.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        // Keep updated_at monotonic for this record even if the clock steps back.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::milliseconds(1)
        };
        self.sync_status = SyncStatus::Pending;
        self.reset_attempts();
    }

    /// Records a local delete as a tombstone.
    pub fn tombstone(&mut self, now: DateTime<Utc>) {
        self.touch(now);
        self.deleted_at = Some(self.updated_at);
    }

    pub fn mark_synced(&mut self) {
        self.sync_status = SyncStatus::Synced;
        self.reset_attempts();
    }

    /// Puts a failed record back in the upload queue.
    pub fn reset_for_retry(&mut self) {
        self.sync_status = SyncStatus::Pending;
        self.reset_attempts();
    }

    /// Records a record-level upload failure.
    ///
    /// `fatal` errors park the record immediately; others back off until
    /// the budget is spent. Returns the resulting status.
    pub fn record_failure(
        &mut self,
        error: &str,
        fatal: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> SyncStatus {
        self.sync_attempts = self.sync_attempts.saturating_add(1);
        self.last_sync_error = Some(error.to_string());

        if fatal || policy.is_exhausted(self.sync_attempts) {
            self.sync_status = SyncStatus::Failed;
            self.next_attempt_at = None;
        } else {
            self.sync_status = SyncStatus::Pending;
            self.next_attempt_at = Some(policy.next_attempt_at(self.sync_attempts, now));
        }
        self.sync_status
    }

    fn reset_attempts(&mut self) {
        self.sync_attempts = 0;
        self.next_attempt_at = None;
        self.last_sync_error = None;
    }
}

// =============================================================================
// Match Keys
// =============================================================================

/// Which secondary identity a [`MatchKey`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKeyKind {
    Email,
    Phone,
    Sku,
}

impl MatchKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKeyKind::Email => "email",
            MatchKeyKind::Phone => "phone",
            MatchKeyKind::Sku => "sku",
        }
    }
}

/// A normalized secondary identity, used only when `external_ref` is absent.
///
/// | Entity        | Key   | Comparison        |
/// |---------------|-------|-------------------|
/// | Customer      | email | case-insensitive  |
/// | Customer      | phone | exact             |
/// | InventoryItem | sku   | exact             |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub kind: MatchKeyKind,
    pub value: String,
}

impl MatchKey {
    /// Email key, trimmed and lowercased. `None` for blank input.
    pub fn email(raw: &str) -> Option<Self> {
        let value = raw.trim().to_lowercase();
        (!value.is_empty()).then_some(MatchKey {
            kind: MatchKeyKind::Email,
            value,
        })
    }

    /// Phone key, trimmed only.
    pub fn phone(raw: &str) -> Option<Self> {
        let value = raw.trim();
        (!value.is_empty()).then(|| MatchKey {
            kind: MatchKeyKind::Phone,
            value: value.to_string(),
        })
    }

    /// SKU key, trimmed only.
    pub fn sku(raw: &str) -> Option<Self> {
        let value = raw.trim();
        (!value.is_empty()).then(|| MatchKey {
            kind: MatchKeyKind::Sku,
            value: value.to_string(),
        })
    }
}

// =============================================================================
// Low-Stock Alert
// =============================================================================

/// Emitted after a merge leaves an item at or below its minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LowStockAlert {
    pub local_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub min_quantity: i64,
}

// =============================================================================
// The Contract
// =============================================================================

/// Implemented by each of the five synced entities.
pub trait SyncableRecord:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Which domain this type belongs to.
    const KIND: EntityKind;

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Secondary identities (empty for domains without one).
    fn match_keys(&self) -> Vec<MatchKey> {
        Vec::new()
    }

    /// Business-rule checks run before a local save and before upload.
    ///
    /// Must hold for anything a remote source hands us too, so format rules
    /// for fields the POS owns do not belong here.
    fn validate(&self) -> ValidationResult<()> {
        Ok(())
    }

    /// Checks for values typed in locally. Run by local saves only.
    fn validate_entry(&self) -> ValidationResult<()> {
        self.validate()
    }

    /// Low-stock side channel; only inventory overrides this.
    fn low_stock_alert(&self) -> Option<LowStockAlert> {
        None
    }

    #[inline]
    fn local_id(&self) -> &str {
        &self.meta().local_id
    }

    #[inline]
    fn external_ref(&self) -> Option<&str> {
        self.meta().external_ref.as_deref()
    }
}

// =============================================================================
// Cloud Row Mapping
// =============================================================================

/// Serializes a record into its Cloud row (bookkeeping stripped).
pub fn to_cloud_row<T: SyncableRecord>(record: &T) -> CoreResult<Value> {
    let mut row = serde_json::to_value(record).map_err(|e| CoreError::Serialization {
        kind: T::KIND.to_string(),
        reason: e.to_string(),
    })?;
    strip_bookkeeping(&mut row);
    Ok(row)
}

/// Decodes a Cloud row. Bookkeeping comes back at its defaults (`pending`,
/// no attempts); the caller decides the final status.
pub fn from_cloud_row<T: SyncableRecord>(mut row: Value) -> CoreResult<T> {
    strip_bookkeeping(&mut row);
    serde_json::from_value(row).map_err(|e| CoreError::Serialization {
        kind: T::KIND.to_string(),
        reason: e.to_string(),
    })
}

fn strip_bookkeeping(row: &mut Value) {
    if let Value::Object(map) = row {
        for field in BOOKKEEPING_FIELDS {
            map.remove(field);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
