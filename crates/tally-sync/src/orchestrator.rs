//! # Sync Orchestrator
//!
//! Owns the five entity syncers and runs them as one cycle in a fixed order.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_now()                                                             │
//! │     │                                                                   │
//! │     ├── is_syncing already set? ──► Skipped (no second cycle)           │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  Customers ─► Inventory ─► Tickets ─► Payments ─► Employees             │
//! │     │                                                                   │
//! │     │  per domain:  upload pending ─► download ─► POS import (if due)   │
//! │     │               error? ─► domain state = error(msg), next domain    │
//! │     ▼                                                                   │
//! │  status: last_sync_date (clean cycle only), last_sync_error, counts     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Customers go first because tickets and payments reference them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tally_core::{Customer, Employee, EntityKind, InventoryItem, Payment, SyncableRecord, Ticket};

use crate::error::{SyncError, SyncResult};
use crate::pos::FromPos;
use crate::scheduler::ReachabilitySignal;
use crate::status::{DomainState, EngineStatus};
use crate::syncer::{EntitySyncer, MergeOutcome, MergeSummary, SyncContext, UploadSummary};

// =============================================================================
// Reports
// =============================================================================

/// What one domain did during a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSummary {
    pub uploaded: UploadSummary,
    pub downloaded: MergeSummary,
    /// Present when a POS import ran for this domain.
    pub imported: Option<MergeSummary>,
}

/// Outcome of a completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub domains: BTreeMap<EntityKind, DomainSummary>,
    /// Domains that failed, with the error message.
    pub errors: BTreeMap<EntityKind, String>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a `sync_now` call.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was already running.
    Skipped,
}

/// Clears the cycle flag when dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs sync cycles across all domains.
pub struct SyncOrchestrator {
    ctx: SyncContext,
    customers: EntitySyncer<Customer>,
    inventory: EntitySyncer<InventoryItem>,
    tickets: EntitySyncer<Ticket>,
    payments: EntitySyncer<Payment>,
    employees: EntitySyncer<Employee>,
    is_syncing: AtomicBool,
    status: RwLock<EngineStatus>,
    reachability: ReachabilitySignal,
    /// Minimum spacing between POS imports.
    pos_poll_interval: Duration,
    last_pos_import: Mutex<Option<Instant>>,
}

impl SyncOrchestrator {
    pub fn new(ctx: SyncContext, pos_poll_interval: Duration) -> Self {
        SyncOrchestrator {
            customers: EntitySyncer::new(ctx.clone()),
            inventory: EntitySyncer::new(ctx.clone()),
            tickets: EntitySyncer::new(ctx.clone()),
            payments: EntitySyncer::new(ctx.clone()),
            employees: EntitySyncer::new(ctx.clone()),
            ctx,
            is_syncing: AtomicBool::new(false),
            status: RwLock::new(EngineStatus::default()),
            reachability: ReachabilitySignal::new(true),
            pos_poll_interval,
            last_pos_import: Mutex::new(None),
        }
    }

    /// Uses an externally driven reachability signal.
    pub fn with_reachability(mut self, signal: ReachabilitySignal) -> Self {
        self.reachability = signal;
        self
    }

    pub fn customers(&self) -> &EntitySyncer<Customer> {
        &self.customers
    }

    pub fn inventory(&self) -> &EntitySyncer<InventoryItem> {
        &self.inventory
    }

    pub fn tickets(&self) -> &EntitySyncer<Ticket> {
        &self.tickets
    }

    pub fn payments(&self) -> &EntitySyncer<Payment> {
        &self.payments
    }

    pub fn employees(&self) -> &EntitySyncer<Employee> {
        &self.employees
    }

    pub fn reachability(&self) -> &ReachabilitySignal {
        &self.reachability
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Status snapshot.
    pub async fn status(&self) -> EngineStatus {
        let mut status = self.status.read().await.clone();
        status.online = self.reachability.is_online();
        status.is_syncing = self.is_syncing();
        status
    }

    /// Runs one full cycle unless one is already running.
    pub async fn sync_now(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::try_acquire(&self.is_syncing) else {
            debug!("Sync already in progress, skipping");
            return CycleOutcome::Skipped;
        };

        info!("Sync cycle started");
        self.publish(|s| s.is_syncing = true).await;

        let import_pos = self.pos_import_due().await;
        let mut report = CycleReport::default();

        for kind in EntityKind::SYNC_ORDER {
            self.set_domain_state(kind, DomainState::Syncing).await;

            let result = match kind {
                EntityKind::Customer => self.sync_pos_domain(&self.customers, import_pos).await,
                EntityKind::InventoryItem => {
                    self.sync_pos_domain(&self.inventory, import_pos).await
                }
                EntityKind::Ticket => self.sync_domain(&self.tickets).await,
                EntityKind::Payment => self.sync_domain(&self.payments).await,
                EntityKind::Employee => self.sync_domain(&self.employees).await,
            };

            match result {
                Ok(summary) => {
                    self.set_domain_state(kind, DomainState::Idle).await;
                    report.domains.insert(kind, summary);
                }
                Err(e) => {
                    warn!(entity = %kind, error = %e, "Domain sync failed");
                    self.ctx.emitter.emit_error(&format!("{kind}: {e}"), e.is_retryable());
                    self.set_domain_state(kind, DomainState::Error(e.to_string()))
                        .await;
                    report.errors.insert(kind, e.to_string());
                }
            }
        }

        if import_pos {
            *self.last_pos_import.lock().await = Some(Instant::now());
        }
        self.refresh_counts().await;

        let first_error = EntityKind::SYNC_ORDER
            .iter()
            .find_map(|kind| report.errors.get(kind).cloned());
        let clean = first_error.is_none();
        let domain_dates = self.domain_sync_dates().await;

        self.publish(|s| {
            s.is_syncing = false;
            if clean {
                s.last_sync_date = Some(Utc::now());
            }
            s.last_sync_error = first_error;
            for (kind, at) in domain_dates {
                if let Some(domain) = s.domain_mut(kind) {
                    domain.last_sync_date = at;
                }
            }
        })
        .await;

        if clean {
            info!("Sync cycle complete");
        } else {
            error!(failed_domains = report.errors.len(), "Sync cycle finished with errors");
        }
        CycleOutcome::Completed(report)
    }

    /// Targeted re-sync of one POS object (webhook path).
    pub async fn resync_pos_object(
        &self,
        kind: EntityKind,
        pos_id: &str,
        import_unknown: bool,
    ) -> SyncResult<MergeOutcome> {
        let outcome = match kind {
            EntityKind::Customer => {
                self.customers
                    .resync_pos_object(pos_id, import_unknown)
                    .await?
            }
            EntityKind::InventoryItem => {
                self.inventory
                    .resync_pos_object(pos_id, import_unknown)
                    .await?
            }
            other => {
                return Err(SyncError::InvalidPayload(format!(
                    "{other} has no POS counterpart"
                )))
            }
        };

        if matches!(
            outcome,
            MergeOutcome::Created | MergeOutcome::Updated | MergeOutcome::Deleted
        ) {
            self.refresh_counts().await;
        }
        Ok(outcome)
    }

    /// Resets failed records in every domain. Returns how many were queued.
    pub async fn retry_all_failed(&self) -> SyncResult<usize> {
        let total = self.customers.retry_failed().await?
            + self.inventory.retry_failed().await?
            + self.tickets.retry_failed().await?
            + self.payments.retry_failed().await?
            + self.employees.retry_failed().await?;
        self.refresh_counts().await;
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Domain Steps
    // -------------------------------------------------------------------------

    async fn sync_domain<T: SyncableRecord>(
        &self,
        syncer: &EntitySyncer<T>,
    ) -> SyncResult<DomainSummary> {
        let uploaded = syncer.upload_pending_changes().await?;
        let downloaded = syncer.download().await?;
        Ok(DomainSummary {
            uploaded,
            downloaded,
            imported: None,
        })
    }

    async fn sync_pos_domain<T: FromPos>(
        &self,
        syncer: &EntitySyncer<T>,
        import_pos: bool,
    ) -> SyncResult<DomainSummary> {
        let mut summary = self.sync_domain(syncer).await?;
        if import_pos {
            let imported = syncer.import_from_pos().await?;
            if imported.changed() > 0 {
                // Push the imported changes to the Cloud in this same cycle.
                let pushed = syncer.upload_pending_changes().await?;
                summary.uploaded.uploaded += pushed.uploaded;
                summary.uploaded.failed += pushed.failed;
            }
            summary.imported = Some(imported);
        }
        Ok(summary)
    }

    async fn pos_import_due(&self) -> bool {
        if self.ctx.pos.is_none() {
            return false;
        }
        match *self.last_pos_import.lock().await {
            Some(at) => at.elapsed() >= self.pos_poll_interval,
            None => true,
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    async fn publish(&self, update: impl FnOnce(&mut EngineStatus)) {
        let snapshot = {
            let mut status = self.status.write().await;
            update(&mut status);
            status.online = self.reachability.is_online();
            status.clone()
        };
        self.ctx.emitter.emit_status(&snapshot);
    }

    async fn set_domain_state(&self, kind: EntityKind, state: DomainState) {
        self.publish(|s| {
            if let Some(domain) = s.domain_mut(kind) {
                domain.state = state;
            }
        })
        .await;
    }

    async fn domain_sync_dates(&self) -> Vec<(EntityKind, Option<chrono::DateTime<Utc>>)> {
        vec![
            (Customer::KIND, self.customers.last_sync_date().await),
            (InventoryItem::KIND, self.inventory.last_sync_date().await),
            (Ticket::KIND, self.tickets.last_sync_date().await),
            (Payment::KIND, self.payments.last_sync_date().await),
            (Employee::KIND, self.employees.last_sync_date().await),
        ]
    }

    /// Re-reads pending/failed counts from the store.
    pub async fn refresh_counts(&self) {
        let counts = vec![
            (Customer::KIND, counts_of(&self.customers).await),
            (InventoryItem::KIND, counts_of(&self.inventory).await),
            (Ticket::KIND, counts_of(&self.tickets).await),
            (Payment::KIND, counts_of(&self.payments).await),
            (Employee::KIND, counts_of(&self.employees).await),
        ];

        let mut status = self.status.write().await;
        for (kind, result) in counts {
            match result {
                Ok((pending, failed)) => {
                    if let Some(domain) = status.domain_mut(kind) {
                        domain.pending = pending;
                        domain.failed = failed;
                    }
                }
                Err(e) => warn!(entity = %kind, error = %e, "Could not count records"),
            }
        }
    }
}

async fn counts_of<T: SyncableRecord>(syncer: &EntitySyncer<T>) -> SyncResult<(i64, i64)> {
    Ok((syncer.pending_count().await?, syncer.failed_count().await?))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Semaphore;

    use crate::cloud::{CloudBackend, CloudFilter};
    use crate::config::SyncSettings;
    use crate::pos::PosCollection;
    use crate::session::SessionContext;
    use crate::test_support::{memory_db, FakeCloud, FakePos, RecordingEmitter, TENANT};
    use tally_core::{to_cloud_row, SyncStatus};

    /// Cloud whose selects wait for a permit.
    struct GatedCloud {
        inner: FakeCloud,
        gate: Semaphore,
    }

    #[async_trait]
    impl CloudBackend for GatedCloud {
        async fn upsert(&self, table: &str, rows: &[Value]) -> SyncResult<()> {
            self.inner.upsert(table, rows).await
        }

        async fn select(
            &self,
            table: &str,
            tenant_id: &str,
            filter: &CloudFilter,
        ) -> SyncResult<Vec<Value>> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SyncError::ChannelError(e.to_string()))?;
            self.inner.select(table, tenant_id, filter).await
        }

        async fn ping(&self) -> SyncResult<()> {
            self.inner.ping().await
        }
    }

    async fn orchestrator(cloud: Arc<dyn CloudBackend>) -> (SyncOrchestrator, Arc<RecordingEmitter>) {
        let emitter = RecordingEmitter::new();
        let ctx = SyncContext::new(
            memory_db().await,
            cloud,
            SessionContext::with_tenant(TENANT),
            &SyncSettings::default(),
        )
        .with_emitter(emitter.clone());
        (SyncOrchestrator::new(ctx, Duration::from_secs(60)), emitter)
    }

    #[tokio::test]
    async fn test_cycle_runs_every_domain_in_order() {
        let cloud = Arc::new(FakeCloud::new());
        let (orch, emitter) = orchestrator(cloud.clone()).await;
        orch.customers()
            .save_local(Customer::new(TENANT, "Ada"))
            .await
            .unwrap();

        let CycleOutcome::Completed(report) = orch.sync_now().await else {
            panic!("cycle skipped");
        };

        assert!(report.is_clean());
        assert_eq!(report.domains.len(), 5);
        assert_eq!(report.domains[&EntityKind::Customer].uploaded.uploaded, 1);
        assert_eq!(cloud.row_count("customers"), 1);

        let status = orch.status().await;
        assert!(status.last_sync_date.is_some());
        assert!(status.last_sync_error.is_none());
        assert!(!status.is_syncing);
        assert_eq!(status.total_pending(), 0);
        assert!(status.domains.iter().all(|d| d.last_sync_date.is_some()));
        assert!(!emitter.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_domain_failure_does_not_stop_other_domains() {
        let cloud = Arc::new(FakeCloud::new());
        let (orch, _emitter) = orchestrator(cloud.clone()).await;

        // Inventory row that cannot be decoded locally.
        cloud.insert_row(
            "inventory_items",
            json!({ "tenant_id": TENANT, "local_id": "bad", "updated_at": "not a date" }),
        );
        orch.payments()
            .save_local(Payment::new(TENANT, tally_core::PaymentMethod::Card, 500))
            .await
            .unwrap();
        cloud.fail_upsert_call(1, SyncError::from_status(503, "down"));

        let CycleOutcome::Completed(report) = orch.sync_now().await else {
            panic!("cycle skipped");
        };

        assert!(report.errors.contains_key(&EntityKind::Payment));
        assert!(report.domains.contains_key(&EntityKind::Employee));
        // Undecodable rows are skipped, not fatal.
        assert_eq!(report.domains[&EntityKind::InventoryItem].downloaded.skipped, 1);

        let status = orch.status().await;
        assert!(status.last_sync_date.is_none());
        assert!(status.last_sync_error.as_deref().unwrap().contains("503"));
        assert!(matches!(
            status.domain(EntityKind::Payment).unwrap().state,
            DomainState::Error(_)
        ));
        assert_eq!(
            status.domain(EntityKind::Employee).unwrap().state,
            DomainState::Idle
        );
        assert_eq!(status.domain(EntityKind::Payment).unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_not_authenticated_marks_every_domain() {
        let cloud = Arc::new(FakeCloud::new());
        let ctx = SyncContext::new(
            memory_db().await,
            cloud.clone(),
            SessionContext::default(),
            &SyncSettings::default(),
        );
        let orch = SyncOrchestrator::new(ctx, Duration::from_secs(60));

        let CycleOutcome::Completed(report) = orch.sync_now().await else {
            panic!("cycle skipped");
        };

        assert_eq!(report.errors.len(), 5);
        assert_eq!(cloud.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_sync_is_noop() {
        let gated = Arc::new(GatedCloud {
            inner: FakeCloud::new(),
            gate: Semaphore::new(0),
        });
        let (orch, _emitter) = orchestrator(gated.clone()).await;
        let orch = Arc::new(orch);

        let running = tokio::spawn({
            let orch = orch.clone();
            async move { orch.sync_now().await }
        });
        while !orch.is_syncing() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(orch.sync_now().await, CycleOutcome::Skipped));
        assert!(orch.status().await.is_syncing);
        assert_eq!(gated.inner.select_calls(), 0);

        gated.gate.add_permits(1);
        let first = running.await.unwrap();
        assert!(matches!(first, CycleOutcome::Completed(_)));
        assert!(!orch.is_syncing());
        assert_eq!(gated.inner.select_calls(), 10);
    }

    #[tokio::test]
    async fn test_pos_import_runs_when_due_and_pushes_to_cloud() {
        let cloud = Arc::new(FakeCloud::new());
        let pos = Arc::new(FakePos::new());
        let ctx = SyncContext::new(
            memory_db().await,
            cloud.clone(),
            SessionContext::with_tenant(TENANT),
            &SyncSettings::default(),
        )
        .with_pos(pos.clone());
        let orch = SyncOrchestrator::new(ctx, Duration::from_secs(3600));
        pos.put(
            PosCollection::Items,
            json!({ "id": "I1", "sku": "SKU-1", "name": "Part", "price_cents": 100 }),
        );

        let CycleOutcome::Completed(report) = orch.sync_now().await else {
            panic!("cycle skipped");
        };
        let inventory = &report.domains[&EntityKind::InventoryItem];
        assert_eq!(inventory.imported.as_ref().unwrap().created, 1);
        assert_eq!(inventory.uploaded.uploaded, 1);
        assert_eq!(cloud.row_count("inventory_items"), 1);

        // Second cycle inside the POS interval skips the import.
        let lists_before = pos.list_calls();
        orch.sync_now().await;
        assert_eq!(pos.list_calls(), lists_before);
    }

    #[tokio::test]
    async fn test_resync_routes_by_kind() {
        let cloud = Arc::new(FakeCloud::new());
        let pos = Arc::new(FakePos::new());
        let ctx = SyncContext::new(
            memory_db().await,
            cloud.clone(),
            SessionContext::with_tenant(TENANT),
            &SyncSettings::default(),
        )
        .with_pos(pos.clone());
        let orch = SyncOrchestrator::new(ctx, Duration::from_secs(60));
        pos.put(
            PosCollection::Customers,
            json!({ "id": "C1", "given_name": "Ada" }),
        );

        let outcome = orch
            .resync_pos_object(EntityKind::Customer, "C1", true)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Created);
        assert_eq!(
            orch.status().await.domain(EntityKind::Customer).unwrap().pending,
            1
        );

        let err = orch
            .resync_pos_object(EntityKind::Payment, "P1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_retry_all_failed() {
        let cloud = Arc::new(FakeCloud::new());
        let (orch, _emitter) = orchestrator(cloud.clone()).await;
        let c = orch
            .customers()
            .save_local(Customer::new(TENANT, "Ada"))
            .await
            .unwrap();
        cloud.fail_upsert_call(1, SyncError::from_status(422, "rejected"));

        orch.sync_now().await;
        assert_eq!(orch.status().await.domain(EntityKind::Customer).unwrap().failed, 1);

        assert_eq!(orch.retry_all_failed().await.unwrap(), 1);
        orch.sync_now().await;
        let stored = orch.customers().get(c.local_id()).await.unwrap().unwrap();
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert_eq!(to_cloud_row(&stored).unwrap()["given_name"], "Ada");
    }
}
