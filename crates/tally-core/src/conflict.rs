//! # Conflict Resolver
//!
//! Decides which version of a record survives when a remote copy meets a
//! local one. Every merge path (Cloud download, tombstones, POS import,
//! webhook re-sync) goes through [`ConflictResolver::resolve`].
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   local has unsynced edits?  (status pending or failed)                │
//! │        │                                                                │
//! │        ├── yes ─► strategy decides                                      │
//! │        │            serverWins  → Remote                                │
//! │        │            localWins   → Local                                 │
//! │        │            newestWins  → greater updated_at, tie → Remote      │
//! │        │                                                                │
//! │        └── no  ─► nothing local to protect                              │
//! │                     serverWins  → Remote                                │
//! │                     otherwise   → Remote unless strictly older          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ties go to the remote copy so that replicas applying the same event
//! stream converge regardless of the order they see it in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::record::SyncMeta;

/// Global conflict strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConflictStrategy {
    /// Remote always wins.
    ServerWins,
    /// Local always wins while it has unsynced edits.
    LocalWins,
    /// Strictly greater `updated_at` wins; ties go to remote.
    #[default]
    NewestWins,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::NewestWins => "newest_wins",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "server_wins" | "serverWins" => Ok(ConflictStrategy::ServerWins),
            "local_wins" | "localWins" => Ok(ConflictStrategy::LocalWins),
            "newest_wins" | "newestWins" => Ok(ConflictStrategy::NewestWins),
            other => Err(CoreError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Outcome of a conflict decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Applies the configured [`ConflictStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        ConflictResolver { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Picks the surviving version.
    pub fn resolve(&self, local: &SyncMeta, remote: &SyncMeta) -> Winner {
        match self.strategy {
            ConflictStrategy::ServerWins => Winner::Remote,
            ConflictStrategy::LocalWins if local.has_local_changes() => Winner::Local,
            ConflictStrategy::LocalWins | ConflictStrategy::NewestWins => newest(local, remote),
        }
    }
}

fn newest(local: &SyncMeta, remote: &SyncMeta) -> Winner {
    if local.updated_at > remote.updated_at {
        Winner::Local
    } else {
        Winner::Remote
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
