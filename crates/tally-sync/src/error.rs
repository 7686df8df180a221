//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Remote              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  Api { status }         │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  NotAuthenticated       │ │
//! │  │  ConfigLoad/Save│  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Record       │  │    Webhook      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  MissingIdent.  │  │  InvalidSig.    │  │  Database               │ │
//! │  │  Conflict       │  │  InvalidPayload │  │  Channel / ShuttingDown │ │
//! │  │  Validation     │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Classes
//! ```text
//!   is_record_fatal()  → mark the record failed, keep going with the batch
//!   aborts_cycle()     → stop this domain's cycle, try again next tick
//!   is_retryable()     → transient; safe to repeat the same request
//! ```

use tally_core::{CoreError, EntityKind, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid Cloud/POS URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// No tenant or session context, or the remote rejected the credential.
    ///
    /// Aborts the current domain's cycle; nothing is retried until the
    /// context is restored.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    // =========================================================================
    // Record Errors
    // =========================================================================
    /// A record reached upload without a `local_id`.
    #[error("{entity} record has no local_id")]
    MissingIdentifier { entity: EntityKind },

    /// A record cannot be reconciled (e.g. a required key is missing).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A local mutation named a record the store does not have.
    #[error("{entity} {local_id} not found")]
    RecordNotFound { entity: EntityKind, local_id: String },

    /// A record failed its business-rule checks.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Transient transport failure (DNS, connect, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The remote answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    // =========================================================================
    // Webhook Errors
    // =========================================================================
    /// Webhook signature missing or wrong. The payload is never processed.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Webhook body is not a recognisable event envelope.
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Local store failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Failed to serialize or decode a record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v),
            CoreError::UnknownStrategy(s) => {
                SyncError::InvalidConfig(format!("unknown conflict strategy '{s}'"))
            }
            other => SyncError::SerializationFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest doesn't report the configured limit
            SyncError::Timeout(0)
        } else if let Some(status) = err.status() {
            SyncError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::NotAuthenticated(format!("unreadable session token: {err}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Maps a non-success HTTP status to the taxonomy.
    ///
    /// ```text
    /// 401              → NotAuthenticated
    /// 408 / 429 / 5xx  → Api (retryable)
    /// other 4xx        → Api (record-fatal)
    /// ```
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 401 {
            SyncError::NotAuthenticated(message)
        } else {
            SyncError::Api { status, message }
        }
    }

    /// Returns true if the same request may succeed if repeated.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - 408, 429 and 5xx responses
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) => true,
            SyncError::Api { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    /// Returns true if the error is about this record and repeating the
    /// upload unchanged will fail the same way.
    pub fn is_record_fatal(&self) -> bool {
        match self {
            SyncError::MissingIdentifier { .. }
            | SyncError::Conflict(_)
            | SyncError::Validation(_)
            | SyncError::SerializationFailed(_) => true,
            SyncError::Api { status, .. } => {
                (400..500).contains(status) && !is_transient_status(*status)
            }
            _ => false,
        }
    }

    /// Returns true if the current domain's cycle should stop: later
    /// records would hit the same wall.
    pub fn aborts_cycle(&self) -> bool {
        match self {
            SyncError::NotAuthenticated(_)
            | SyncError::Network(_)
            | SyncError::Timeout(_)
            | SyncError::Database(_)
            | SyncError::InvalidConfig(_)
            | SyncError::ShuttingDown => true,
            SyncError::Api { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    /// Returns true if the failure should count against the record's retry
    /// budget. The remote saw the record and refused it; transport and
    /// auth failures never reached that point.
    pub fn consumes_attempt(&self) -> bool {
        match self {
            SyncError::Api { .. } => true,
            other => other.is_record_fatal(),
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());
        assert!(SyncError::from_status(503, "unavailable").is_retryable());
        assert!(SyncError::from_status(429, "slow down").is_retryable());

        assert!(!SyncError::from_status(422, "bad row").is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::InvalidSignature.is_retryable());
    }

    #[test]
    fn test_401_maps_to_not_authenticated() {
        let err = SyncError::from_status(401, "expired");
        assert!(matches!(err, SyncError::NotAuthenticated(_)));
        assert!(err.aborts_cycle());
        assert!(!err.consumes_attempt());
    }

    #[test]
    fn test_4xx_is_record_fatal_5xx_aborts() {
        let bad_row = SyncError::from_status(400, "bad row");
        assert!(bad_row.is_record_fatal());
        assert!(!bad_row.aborts_cycle());

        let outage = SyncError::from_status(502, "bad gateway");
        assert!(!outage.is_record_fatal());
        assert!(outage.aborts_cycle());
        assert!(outage.consumes_attempt());
    }

    #[test]
    fn test_network_errors_do_not_consume_attempts() {
        let err = SyncError::Network("dns".into());
        assert!(err.aborts_cycle());
        assert!(!err.consumes_attempt());
        assert!(!err.is_record_fatal());
    }

    #[test]
    fn test_contract_violations_are_record_fatal() {
        let err = SyncError::MissingIdentifier {
            entity: EntityKind::Payment,
        };
        assert!(err.is_record_fatal());
        assert!(err.to_string().contains("payment"));
        assert!(SyncError::Conflict("no key".into()).is_record_fatal());
    }
}
