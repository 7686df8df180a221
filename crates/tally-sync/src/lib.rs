//! # tally-sync: Multi-Backend Sync Engine for Tally
//!
//! Keeps the local store consistent with two authoritative external
//! systems: the POS platform (catalog, customers) and the multi-tenant
//! Cloud backend (cross-device mirror of every domain).
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────┐   tick    ┌──────────────────────────────────────┐   │
//! │  │  Scheduler   │ ────────► │          SyncOrchestrator            │   │
//! │  │ + Reachabil- │           │                                      │   │
//! │  │ ity monitor  │           │  Customers → Inventory → Tickets     │   │
//! │  └──────────────┘           │            → Payments  → Employees   │   │
//! │                             └──────────────────┬───────────────────┘   │
//! │  ┌──────────────┐  resync one object           │                       │
//! │  │ Webhook      │ ─────────────────────────────┤                       │
//! │  │ (axum + mpsc │                              ▼                       │
//! │  │  + worker)   │           ┌──────────────────────────────────────┐   │
//! │  └──────────────┘           │        EntitySyncer<T>  ×5           │   │
//! │                             │  upload · download · merge · import  │   │
//! │                             └───┬──────────────┬───────────────┬───┘   │
//! │                                 │              │               │       │
//! │                   ┌─────────────▼──┐  ┌────────▼───────┐  ┌────▼────┐  │
//! │                   │ IdentityResolv.│  │ CloudBackend   │  │   POS   │  │
//! │                   │ ConflictResolv.│  │ BatchUploader  │  │ Platform│  │
//! │                   └───────┬────────┘  └────────────────┘  └─────────┘  │
//! │                           │                                             │
//! │                   ┌───────▼────────┐                                    │
//! │                   │   tally-db     │                                    │
//! │                   └────────────────┘                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`orchestrator`] - One cycle across all five domains, status register
//! - [`syncer`] - Generic per-entity upload, download and merge
//! - [`identity`] - local id → POS id → secondary key lookup
//! - [`uploader`] - Chunked bulk upserts
//! - [`scheduler`] - Periodic ticks and reachability
//! - [`webhook`] - Signed POS push notifications
//!
//! ### Collaborators
//! - [`cloud`] - Cloud REST client (`CloudBackend`)
//! - [`pos`] - POS REST client (`PosPlatform`) and DTO mapping
//! - [`session`] - Tenant and bearer token resolution
//!
//! ### Support
//! - [`config`] - `SyncConfig` (TOML + environment)
//! - [`error`] - Sync error types and their handling classes
//! - [`events`] - Observer hooks
//! - [`status`] - Status snapshot types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{CloudHttpClient, SessionContext, SyncConfig, SyncContext, SyncOrchestrator};
//!
//! let config = SyncConfig::load_or_default(None);
//! let session = SessionContext::from_settings(&config.cloud)?;
//! let cloud = CloudHttpClient::new(&config.cloud, session.clone(), config.request_timeout())?;
//!
//! let ctx = SyncContext::new(database, Arc::new(cloud), session, &config.sync);
//! let orchestrator = SyncOrchestrator::new(ctx, config.pos_poll_interval());
//! orchestrator.sync_now().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod events;
pub mod status;

pub mod cloud;
pub mod pos;
pub mod session;

pub mod identity;
pub mod orchestrator;
pub mod scheduler;
pub mod syncer;
pub mod uploader;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{CloudSettings, PosSettings, SyncConfig, SyncSettings, WebhookSettings};
pub use error::{SyncError, SyncResult};
pub use events::{AuditEvent, LogEmitter, NoOpEmitter, SyncEventEmitter};
pub use status::{DomainState, DomainStatus, EngineStatus};

pub use cloud::{CloudBackend, CloudFilter, CloudHttpClient};
pub use pos::{FromPos, PosCollection, PosHttpClient, PosPlatform};
pub use session::{Session, SessionContext};

pub use identity::{IdentityResolver, MatchedBy, Resolution};
pub use orchestrator::{CycleOutcome, CycleReport, DomainSummary, SyncOrchestrator};
pub use scheduler::{
    ReachabilityMonitor, ReachabilityMonitorHandle, ReachabilitySignal, Scheduler, SchedulerHandle,
    TickOutcome,
};
pub use syncer::{EntitySyncer, MergeOutcome, MergeSummary, SyncContext, UploadSummary};
pub use uploader::{BatchReport, BatchUploader, ChunkFailure, RecordRejection};
pub use webhook::{
    IngestOutcome, WebhookIngestor, WebhookJob, WebhookServer, WebhookServerHandle,
    WebhookVerifier, WebhookWorker,
};
