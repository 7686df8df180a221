//! # Retry Policy
//!
//! Per-record retry bookkeeping for uploads.
//!
//! ## Record State Machine
//! ```text
//!                  local mutation / retry_failed()
//!        ┌─────────────────────────────────────────────────┐
//!        ▼                                                 │
//!   ┌─────────┐   upload ok    ┌────────┐                  │
//!   │ PENDING │ ─────────────► │ SYNCED │ ─────────────────┤
//!   └────┬────┘                └────────┘  local mutation  │
//!        │                                                 │
//!        │ record error: attempts += 1,                    │
//!        │ next_attempt_at = now + backoff(attempts)       │
//!        │                                                 │
//!        │ attempts >= max_attempts  OR  record-fatal      │
//!        ▼                                                 │
//!   ┌─────────┐                                            │
//!   │ FAILED  │ ───────────────────────────────────────────┘
//!   └─────────┘
//!
//!   Network errors abort the cycle without touching the counter.
//! ```
//!
//! ## Backoff
//! `delay(n) = min(initial * 2^(n-1), max)`; with the defaults that is
//! 30s, 60s, 120s ... capped at one hour. No policy waits longer than
//! [`DELAY_CEILING_SECS`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default number of record-level failures before a record is parked.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Default first backoff step.
pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 30;

/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 3600;

/// Hard ceiling for any configured backoff (30 days).
pub const DELAY_CEILING_SECS: u64 = 30 * 24 * 3600;

/// Retry limits applied to every record of every domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures allowed before the record goes terminal.
    pub max_attempts: u32,

    /// First backoff delay in seconds.
    pub initial_delay_secs: u64,

    /// Backoff ceiling in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_secs: DEFAULT_INITIAL_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following failure number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .initial_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs)
            .min(DELAY_CEILING_SECS);
        Duration::seconds(secs as i64)
    }

    /// When a record that has now failed `attempt` times may be retried.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay_for(attempt)
    }

    /// Whether `attempts` failures exhaust the budget.
    #[inline]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
