//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Parsing and record contract errors             │
//! │  └── ValidationError  - Field-level validation failures                │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Local store failures                           │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - Network, auth, webhook, per-record failures    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → domain status string  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by the pure record contract.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An entity kind string did not name one of the synced domains.
    #[error("Unknown entity kind: {0}")]
    UnknownEntityKind(String),

    /// A persisted sync status string was not recognised.
    #[error("Unknown sync status: {0}")]
    UnknownSyncStatus(String),

    /// A configured conflict strategy name was not recognised.
    ///
    /// Accepts both `newest_wins` and `newestWins` spellings.
    #[error("Unknown conflict strategy: {0}")]
    UnknownStrategy(String),

    /// A record could not be mapped to or from its Cloud row.
    #[error("Record {kind} could not be (de)serialized: {reason}")]
    Serialization { kind: String, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field-level validation errors.
///
/// A record failing validation is never uploaded; the engine marks it
/// `failed` so an operator can inspect it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Value must not be zero.
    #[error("{field} must not be zero")]
    Zero { field: String },

    /// Invalid format (e.g., malformed email).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
