//! # Engine Status
//!
//! Snapshot types observers read: per-domain state plus the cycle-wide
//! `last_sync_date` / `last_sync_error`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use tally_core::EntityKind;

/// State of one entity domain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum DomainState {
    #[default]
    Idle,
    Syncing,
    Error(String),
}

/// Per-domain status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainStatus {
    pub kind: EntityKind,
    pub state: DomainState,
    /// Last successful download for this domain.
    pub last_sync_date: Option<DateTime<Utc>>,
    /// Records waiting for upload.
    pub pending: i64,
    /// Records parked after exhausting retries or a fatal error.
    pub failed: i64,
}

impl DomainStatus {
    pub fn new(kind: EntityKind) -> Self {
        DomainStatus {
            kind,
            state: DomainState::Idle,
            last_sync_date: None,
            pending: 0,
            failed: 0,
        }
    }
}

/// Whole-engine status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Network reachability as last signalled.
    pub online: bool,
    /// A cycle is running right now.
    pub is_syncing: bool,
    /// End of the last cycle in which every domain succeeded.
    pub last_sync_date: Option<DateTime<Utc>>,
    /// First domain error of the last cycle, cleared by a clean cycle.
    pub last_sync_error: Option<String>,
    /// One entry per domain, in sync order.
    pub domains: Vec<DomainStatus>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        EngineStatus {
            online: true,
            is_syncing: false,
            last_sync_date: None,
            last_sync_error: None,
            domains: EntityKind::SYNC_ORDER
                .iter()
                .copied()
                .map(DomainStatus::new)
                .collect(),
        }
    }
}

impl EngineStatus {
    pub fn domain(&self, kind: EntityKind) -> Option<&DomainStatus> {
        self.domains.iter().find(|d| d.kind == kind)
    }

    pub(crate) fn domain_mut(&mut self, kind: EntityKind) -> Option<&mut DomainStatus> {
        self.domains.iter_mut().find(|d| d.kind == kind)
    }

    pub fn total_pending(&self) -> i64 {
        self.domains.iter().map(|d| d.pending).sum()
    }
}
