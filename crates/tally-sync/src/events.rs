//! # Sync Events
//!
//! Side-channel notifications for observers (UI, audit log). Nothing here
//! affects sync correctness.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use tally_core::LowStockAlert;

use crate::status::EngineStatus;

/// Audit trail entries for operator-visible mutations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditEvent {
    StockAdjusted {
        local_id: String,
        sku: String,
        delta: i64,
        quantity: i64,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Trait for emitting sync events (implemented by the embedding app).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits an engine status change.
    fn emit_status(&self, status: &EngineStatus);

    /// Emits a low-stock alert after an inventory merge.
    fn emit_low_stock(&self, alert: &LowStockAlert);

    /// Emits an audit event.
    fn emit_audit(&self, event: &AuditEvent);

    /// Emits a domain error.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &EngineStatus) {}
    fn emit_low_stock(&self, _alert: &LowStockAlert) {}
    fn emit_audit(&self, _event: &AuditEvent) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

/// Emitter that writes events to the tracing log. Used by the daemon.
pub struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_status(&self, status: &EngineStatus) {
        debug!(
            online = status.online,
            syncing = status.is_syncing,
            pending = status.total_pending(),
            last_sync = ?status.last_sync_date,
            "Sync status"
        );
    }

    fn emit_low_stock(&self, alert: &LowStockAlert) {
        info!(
            local_id = %alert.local_id,
            sku = %alert.sku,
            quantity = alert.quantity,
            min_quantity = alert.min_quantity,
            "Low stock"
        );
    }

    fn emit_audit(&self, event: &AuditEvent) {
        match event {
            AuditEvent::StockAdjusted {
                local_id,
                delta,
                quantity,
                reason,
                ..
            } => info!(%local_id, delta, quantity, ?reason, "Audit: stock adjusted"),
        }
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        warn!(%message, retryable, "Sync error reported");
    }
}
