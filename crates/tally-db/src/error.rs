//! # Database Error Types
//!
//! Failures of the local store, grouped by what the caller can do about
//! them.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error / MigrateError       serde_json::Error (payload)           │
//! │       │                                 │                               │
//! │       ▼                                 ▼                               │
//! │  DbError (this module)                                                  │
//! │    Open / Migration ........ store unusable, daemon exits               │
//! │    Busy .................... transient, next cycle retries             │
//! │    DuplicateExternalRef .... two records linked to one POS object      │
//! │    CorruptPayload/Cursor ... row on disk no longer decodes             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Database (tally-sync) ← aborts the domain's cycle          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Local store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The store could not be opened.
    #[error("Cannot open local store: {0}")]
    Open(String),

    /// An embedded migration failed to apply.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Pool timed out or SQLite reported the file locked.
    #[error("Local store busy: {0}")]
    Busy(String),

    /// A second record claimed an `external_ref` already linked locally.
    #[error("External reference already linked: {0}")]
    DuplicateExternalRef(String),

    /// A stored record payload no longer decodes into its entity.
    #[error("Payload for {entity} {id} is unreadable: {reason}")]
    CorruptPayload {
        entity: String,
        id: String,
        reason: String,
    },

    /// A stored cursor is not a representable timestamp.
    #[error("Cursor {entity}/{name} holds an invalid timestamp: {value_ms}")]
    CorruptCursor {
        entity: String,
        name: String,
        value_ms: i64,
    },

    /// Any other SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(String),
}

impl DbError {
    pub(crate) fn corrupt(
        entity: impl Into<String>,
        id: impl Into<String>,
        err: serde_json::Error,
    ) -> Self {
        DbError::CorruptPayload {
            entity: entity.into(),
            id: id.into(),
            reason: err.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy(_))
    }
}

/// ```text
/// PoolTimedOut / SQLITE_BUSY / SQLITE_LOCKED   → Busy
/// UNIQUE on sync_records.external_ref          → DuplicateExternalRef
/// PoolClosed                                   → Open
/// anything else                                → Sqlite
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => DbError::Busy("connection pool timed out".into()),
            sqlx::Error::PoolClosed => DbError::Open("pool is closed".into()),
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                if msg.contains("database is locked") || msg.contains("database table is locked") {
                    DbError::Busy(msg.to_string())
                } else if msg.starts_with("UNIQUE constraint failed")
                    && msg.contains("external_ref")
                {
                    DbError::DuplicateExternalRef(msg.to_string())
                } else {
                    DbError::Sqlite(msg.to_string())
                }
            }
            other => DbError::Sqlite(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Busy(_)));
        assert!(err.is_transient());
        assert!(!DbError::Sqlite("syntax error".into()).is_transient());
    }
}
