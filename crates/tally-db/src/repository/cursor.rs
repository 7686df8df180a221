//! # Sync Cursor Repository
//!
//! Named per-domain timestamps, e.g. the last tombstone pull, so an
//! incremental query can resume after a restart.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use tally_core::EntityKind;

/// Repository for sync cursors.
#[derive(Debug, Clone)]
pub struct CursorRepository {
    pool: SqlitePool,
}

impl CursorRepository {
    /// Creates a new CursorRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CursorRepository { pool }
    }

    /// Reads a cursor; `None` if it was never set.
    pub async fn get(&self, kind: EntityKind, name: &str) -> DbResult<Option<DateTime<Utc>>> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT value_ms FROM sync_cursors WHERE entity_kind = ?1 AND name = ?2",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        value
            .map(|ms| {
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| DbError::CorruptCursor {
                        entity: kind.to_string(),
                        name: name.to_string(),
                        value_ms: ms,
                    })
            })
            .transpose()
    }

    /// Writes a cursor.
    pub async fn set(&self, kind: EntityKind, name: &str, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (entity_kind, name, value_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT (entity_kind, name) DO UPDATE SET value_ms = excluded.value_ms
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cursors = db.cursors();

        assert!(cursors
            .get(EntityKind::Customer, "tombstones")
            .await
            .unwrap()
            .is_none());

        let first = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        cursors.set(EntityKind::Customer, "tombstones", first).await.unwrap();
        let second = first + chrono::Duration::seconds(5);
        cursors.set(EntityKind::Customer, "tombstones", second).await.unwrap();

        assert_eq!(
            cursors.get(EntityKind::Customer, "tombstones").await.unwrap(),
            Some(second)
        );
        assert!(cursors
            .get(EntityKind::Ticket, "tombstones")
            .await
            .unwrap()
            .is_none());
    }
}
