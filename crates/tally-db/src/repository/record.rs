//! # Record Repository
//!
//! Generic storage for every [`SyncableRecord`] type.
//!
//! ## Row Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_records                                                           │
//! │  ┌─────────────┬──────────┬──────────────┬───────────────┬──────────┐  │
//! │  │ entity_kind │ local_id │ external_ref │ sync_status … │ payload  │  │
//! │  ├─────────────┼──────────┼──────────────┼───────────────┼──────────┤  │
//! │  │ customer    │ 9f1c…    │ POS-123      │ synced        │ {json}   │  │
//! │  │ customer    │ 77ab…    │ NULL         │ pending       │ {json}   │  │
//! │  └─────────────┴──────────┴──────────────┴───────────────┴──────────┘  │
//! │        ▲                                                                │
//! │        │ (entity_kind, local_id)                                        │
//! │  sync_match_keys: email / phone / sku → local_id                        │
//! │                                                                         │
//! │  payload is the source of truth; the other columns mirror the fields   │
//! │  the engine filters on and are rewritten with it on every save.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{MatchKey, SyncStatus, SyncableRecord};

// =============================================================================
// Query Description
// =============================================================================

/// Sort order for [`RecordQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordOrder {
    #[default]
    UpdatedAsc,
    UpdatedDesc,
}

/// Filter, sort and limit for [`RecordRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub status: Option<SyncStatus>,
    /// Tombstoned rows are skipped unless set.
    pub include_deleted: bool,
    pub updated_since: Option<DateTime<Utc>>,
    pub order: RecordOrder,
    pub limit: Option<u32>,
}

impl RecordQuery {
    /// Every live record, oldest change first.
    pub fn all() -> Self {
        RecordQuery::default()
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    pub fn order(mut self, order: RecordOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(sqlx::FromRow)]
struct PayloadRow {
    local_id: String,
    payload: String,
}

impl PayloadRow {
    fn decode<T: SyncableRecord>(self) -> DbResult<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| DbError::corrupt(T::KIND.as_str(), self.local_id, e))
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for synced records of any kind.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Fetches a record by `local_id`, tombstoned or not.
    pub async fn get<T: SyncableRecord>(&self, local_id: &str) -> DbResult<Option<T>> {
        let row: Option<PayloadRow> = sqlx::query_as(
            "SELECT local_id, payload FROM sync_records WHERE entity_kind = ?1 AND local_id = ?2",
        )
        .bind(T::KIND.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PayloadRow::decode).transpose()
    }

    /// Fetches a record by its POS object id.
    pub async fn find_by_external_ref<T: SyncableRecord>(
        &self,
        external_ref: &str,
    ) -> DbResult<Option<T>> {
        let row: Option<PayloadRow> = sqlx::query_as(
            r#"
            SELECT local_id, payload FROM sync_records
            WHERE entity_kind = ?1 AND external_ref = ?2
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PayloadRow::decode).transpose()
    }

    /// Finds a live record that is not yet linked to a POS object and
    /// carries `key`. The oldest such record wins when several share it.
    ///
    /// Records already carrying an `external_ref` are skipped: they belong
    /// to a different POS object.
    pub async fn find_by_match_key<T: SyncableRecord>(
        &self,
        key: &MatchKey,
    ) -> DbResult<Option<T>> {
        let row: Option<PayloadRow> = sqlx::query_as(
            r#"
            SELECT r.local_id, r.payload
            FROM sync_match_keys k
            JOIN sync_records r
              ON r.entity_kind = k.entity_kind AND r.local_id = k.local_id
            WHERE k.entity_kind = ?1
              AND k.key_kind = ?2
              AND k.key_value = ?3
              AND r.deleted_at_ms IS NULL
              AND r.external_ref IS NULL
            ORDER BY r.updated_at_ms ASC, r.local_id ASC
            LIMIT 1
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(key.kind.as_str())
        .bind(&key.value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PayloadRow::decode).transpose()
    }

    /// Lists records matching `query`.
    pub async fn list<T: SyncableRecord>(&self, query: &RecordQuery) -> DbResult<Vec<T>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT local_id, payload FROM sync_records WHERE entity_kind = ");
        qb.push_bind(T::KIND.as_str());

        if let Some(status) = query.status {
            qb.push(" AND sync_status = ").push_bind(status.as_str());
        }
        if !query.include_deleted {
            qb.push(" AND deleted_at_ms IS NULL");
        }
        if let Some(since) = query.updated_since {
            qb.push(" AND updated_at_ms >= ")
                .push_bind(since.timestamp_millis());
        }
        qb.push(match query.order {
            RecordOrder::UpdatedAsc => " ORDER BY updated_at_ms ASC, local_id ASC",
            RecordOrder::UpdatedDesc => " ORDER BY updated_at_ms DESC, local_id ASC",
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<PayloadRow> = qb.build_query_as::<PayloadRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(PayloadRow::decode).collect()
    }

    /// Pending records (tombstones included) whose backoff has elapsed,
    /// oldest change first.
    pub async fn list_due<T: SyncableRecord>(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<T>> {
        let rows: Vec<PayloadRow> = sqlx::query_as(
            r#"
            SELECT local_id, payload FROM sync_records
            WHERE entity_kind = ?1
              AND sync_status = 'pending'
              AND (next_attempt_at_ms IS NULL OR next_attempt_at_ms <= ?2)
            ORDER BY updated_at_ms ASC, local_id ASC
            LIMIT ?3
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PayloadRow::decode).collect()
    }

    /// Counts records of kind `T` in `status`, tombstones included.
    pub async fn count_with_status<T: SyncableRecord>(&self, status: SyncStatus) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_records WHERE entity_kind = ?1 AND sync_status = ?2",
        )
        .bind(T::KIND.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Inserts or replaces one record and its match keys.
    pub async fn save<T: SyncableRecord>(&self, record: &T) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        write_record(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Saves a unit of work: every record or none.
    pub async fn save_all<T: SyncableRecord>(&self, records: &[T]) -> DbResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            write_record(&mut *tx, record).await?;
        }
        tx.commit().await?;

        debug!(entity = %T::KIND, count = records.len(), "Saved records");
        Ok(())
    }

    /// Removes a record outright. Only used when a remote tombstone wins.
    pub async fn hard_delete<T: SyncableRecord>(&self, local_id: &str) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM sync_records WHERE entity_kind = ?1 AND local_id = ?2")
                .bind(T::KIND.as_str())
                .bind(local_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

async fn write_record<T: SyncableRecord>(
    conn: &mut SqliteConnection,
    record: &T,
) -> DbResult<()> {
    let kind = T::KIND.as_str();
    let meta = record.meta();
    let payload = serde_json::to_string(record)
        .map_err(|e| DbError::corrupt(kind, meta.local_id.as_str(), e))?;

    sqlx::query(
        r#"
        INSERT INTO sync_records (
            entity_kind, local_id, tenant_id, external_ref,
            updated_at_ms, deleted_at_ms, sync_status, sync_attempts,
            next_attempt_at_ms, last_sync_error, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT (entity_kind, local_id) DO UPDATE SET
            tenant_id = excluded.tenant_id,
            external_ref = excluded.external_ref,
            updated_at_ms = excluded.updated_at_ms,
            deleted_at_ms = excluded.deleted_at_ms,
            sync_status = excluded.sync_status,
            sync_attempts = excluded.sync_attempts,
            next_attempt_at_ms = excluded.next_attempt_at_ms,
            last_sync_error = excluded.last_sync_error,
            payload = excluded.payload
        "#,
    )
    .bind(kind)
    .bind(&meta.local_id)
    .bind(&meta.tenant_id)
    .bind(meta.external_ref.as_deref())
    .bind(meta.updated_at.timestamp_millis())
    .bind(meta.deleted_at.map(|at| at.timestamp_millis()))
    .bind(meta.sync_status.as_str())
    .bind(i64::from(meta.sync_attempts))
    .bind(meta.next_attempt_at.map(|at| at.timestamp_millis()))
    .bind(meta.last_sync_error.as_deref())
    .bind(payload)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM sync_match_keys WHERE entity_kind = ?1 AND local_id = ?2")
        .bind(kind)
        .bind(&meta.local_id)
        .execute(&mut *conn)
        .await?;

    for key in record.match_keys() {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sync_match_keys (entity_kind, key_kind, key_value, local_id)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(kind)
        .bind(key.kind.as_str())
        .bind(&key.value)
        .bind(&meta.local_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
