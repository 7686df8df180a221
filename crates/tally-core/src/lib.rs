//! # tally-core: Pure Sync Types for Tally
//!
//! The record contract and the decision rules of the sync engine, as pure
//! functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 tally-sync (engine)                             │   │
//! │  │   Scheduler ──► Orchestrator ──► EntitySyncer<T> ×5             │   │
//! │  │   Webhook ingestor ───────────────────┘                         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  record   │  │   types   │  │ conflict  │  │   retry   │  │   │
//! │  │   │ SyncMeta  │  │ Customer  │  │ Resolver  │  │  Policy   │  │   │
//! │  │   │ MatchKey  │  │ Inventory │  │  Winner   │  │  backoff  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Local Store)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - `SyncMeta`, `SyncableRecord`, match keys, Cloud row mapping
//! - [`types`] - The five entities
//! - [`conflict`] - Conflict strategies and the resolver
//! - [`retry`] - Per-record retry budget and backoff
//! - [`validation`] - Field validators
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::{ConflictResolver, ConflictStrategy, Customer, SyncableRecord, Winner};
//!
//! let mut local = Customer::new("shop-1", "Ada");
//! local.email = Some("ada@example.com".into());
//!
//! let mut remote = local.clone();
//! remote.meta.updated_at = local.meta.updated_at + chrono::Duration::seconds(5);
//!
//! let resolver = ConflictResolver::new(ConflictStrategy::NewestWins);
//! assert_eq!(resolver.resolve(local.meta(), remote.meta()), Winner::Remote);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod record;
pub mod retry;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{ConflictResolver, ConflictStrategy, Winner};
pub use error::{CoreError, CoreResult, ValidationError};
pub use record::{
    from_cloud_row, to_cloud_row, EntityKind, LowStockAlert, MatchKey, MatchKeyKind, SyncMeta,
    SyncStatus, SyncableRecord,
};
pub use retry::{RetryPolicy, DELAY_CEILING_SECS};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Rows per Cloud upsert call when pushing collections.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Interval between scheduled sync cycles.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
