//! # Entity Syncer
//!
//! Upload, download and merge for one entity type. One instance per domain;
//! all five share a [`SyncContext`].
//!
//! ## Record State Machine
//! ```text
//!                 local mutation (touch / tombstone)
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!   ┌─────────┐   upload ok    ┌────────┐               │
//!   │ pending │ ─────────────► │ synced │ ──────────────┘
//!   └─────────┘                └────────┘
//!     │    ▲
//!     │    │ transient failure: attempts += 1, next_attempt_at = backoff
//!     │    └────────────────────┐
//!     │                         │
//!     │ fatal error, or attempts reach max_attempts
//!     ▼
//!   ┌────────┐   retry_failed() / local mutation
//!   │ failed │ ─────────────────────────────────► pending
//!   └────────┘
//! ```
//!
//! ## Merge
//! ```text
//! remote ──► IdentityResolver ──New──────► create (Cloud: synced, POS: pending)
//!                  │
//!               Existing ──► ConflictResolver ──Local──► keep, upload later
//!                                  │
//!                                Remote ──► Cloud tombstone: hard delete
//!                                           POS gone:        local tombstone
//!                                           otherwise:       overwrite
//! ```
//!
//! ## Store Access
//! Every read-modify-write of the store runs under the context's write
//! lane. Network calls never run under it: an upload reads the record,
//! releases the lane, talks to the Cloud, then re-takes the lane to commit,
//! and only marks the record synced if nobody touched it in between.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use tally_core::{
    from_cloud_row, to_cloud_row, ConflictResolver, InventoryItem, RetryPolicy, SyncMeta,
    SyncStatus, SyncableRecord, Winner,
};
use tally_db::{Database, RecordQuery};

use crate::cloud::{CloudBackend, CloudFilter, SYNCED_AT};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{AuditEvent, NoOpEmitter, SyncEventEmitter};
use crate::identity::{IdentityResolver, Resolution};
use crate::pos::{FromPos, PosPlatform};
use crate::session::SessionContext;
use crate::uploader::{BatchReport, BatchUploader, RecordRejection};

/// Cursor name for the tombstone download path. Holds the newest backend
/// write stamp (`synced_at`) seen on a tombstone.
const TOMBSTONE_CURSOR: &str = "last_tombstone_sync";

/// Tombstones written this close before the cursor are pulled again, so
/// writes that commit out of stamp order are not skipped.
const TOMBSTONE_OVERLAP_SECS: i64 = 60;

/// Upper bound on records taken per `upload_pending_changes` call.
const MAX_PENDING_PER_CYCLE: u32 = 10_000;

// =============================================================================
// Context
// =============================================================================

/// Collaborators and policy shared by every syncer.
#[derive(Clone)]
pub struct SyncContext {
    pub db: Database,
    pub cloud: Arc<dyn CloudBackend>,
    pub pos: Option<Arc<dyn PosPlatform>>,
    pub session: SessionContext,
    pub resolver: ConflictResolver,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub emitter: Arc<dyn SyncEventEmitter>,
    write_lane: Arc<Mutex<()>>,
}

impl SyncContext {
    pub fn new(
        db: Database,
        cloud: Arc<dyn CloudBackend>,
        session: SessionContext,
        settings: &SyncSettings,
    ) -> Self {
        SyncContext {
            db,
            cloud,
            pos: None,
            session,
            resolver: ConflictResolver::new(settings.conflict_strategy),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                initial_delay_secs: settings.initial_backoff_secs,
                max_delay_secs: settings.max_backoff_secs,
            },
            batch_size: settings.batch_size,
            emitter: Arc::new(NoOpEmitter),
            write_lane: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_pos(mut self, pos: Arc<dyn PosPlatform>) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What a single merge did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    /// Remote tombstone won; the local row is gone (Cloud) or tombstoned (POS).
    Deleted,
    /// Local version won the conflict and will be uploaded.
    KeptLocal,
    /// Remote carried nothing new.
    Unchanged,
    /// Nothing to merge into (e.g. a tombstone for a record never mirrored).
    Ignored,
}

/// Tally of merge outcomes for one download or import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub kept_local: usize,
    pub unchanged: usize,
    pub ignored: usize,
    /// Remote objects that could not be decoded.
    pub skipped: usize,
}

impl MergeSummary {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Created => self.created += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Deleted => self.deleted += 1,
            MergeOutcome::KeptLocal => self.kept_local += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::Ignored => self.ignored += 1,
        }
    }

    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Tally of one `upload_pending_changes` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    /// Record-level failures (backed off or parked).
    pub failed: usize,
}

/// Clears the syncing flag when dropped.
struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        SyncingFlag(flag)
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Entity Syncer
// =============================================================================

/// Sync pipeline for entity type `T`.
pub struct EntitySyncer<T> {
    ctx: SyncContext,
    identity: IdentityResolver,
    uploader: BatchUploader,
    is_syncing: AtomicBool,
    last_sync_date: RwLock<Option<DateTime<Utc>>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: SyncableRecord> EntitySyncer<T> {
    pub fn new(ctx: SyncContext) -> Self {
        EntitySyncer {
            identity: IdentityResolver::new(ctx.db.records()),
            uploader: BatchUploader::new(ctx.cloud.clone(), ctx.batch_size),
            ctx,
            is_syncing: AtomicBool::new(false),
            last_sync_date: RwLock::new(None),
            _kind: PhantomData,
        }
    }

    /// True while a download is running.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// End of the last successful download.
    pub async fn last_sync_date(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_date.read().await
    }

    // -------------------------------------------------------------------------
    // Upload
    // -------------------------------------------------------------------------

    /// Upserts one record to the Cloud, then stores it as `synced`.
    ///
    /// Returns the stored record. If the record was edited locally while
    /// the upload was in flight, the newer edit stays `pending`.
    #[instrument(skip_all, fields(entity = %T::KIND, local_id = %record.local_id()))]
    pub async fn upload(&self, record: T) -> SyncResult<T> {
        let record = self.prepare_for_upload(record).await?;
        let row = to_cloud_row(&record)?;

        self.ctx.cloud.upsert(T::KIND.table(), &[row]).await?;
        debug!("Uploaded");

        let mut committed = self.commit_uploaded(vec![record]).await?;
        committed
            .pop()
            .ok_or_else(|| SyncError::Internal("upload commit returned nothing".into()))
    }

    /// Uploads every due `pending` record, one at a time, oldest change
    /// first.
    ///
    /// Record-level failures are recorded on the record and the pass goes
    /// on. Errors that would hit every later record too (auth, transport,
    /// Cloud outage) stop the pass and are returned; the remaining records
    /// stay `pending` for the next cycle.
    pub async fn upload_pending_changes(&self) -> SyncResult<UploadSummary> {
        self.ctx.session.tenant_id().await?;

        let due = self
            .ctx
            .db
            .records()
            .list_due::<T>(Utc::now(), MAX_PENDING_PER_CYCLE)
            .await?;

        let mut summary = UploadSummary::default();
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(entity = %T::KIND, count = due.len(), "Uploading pending records");

        for record in due {
            match self.upload(record.clone()).await {
                Ok(_) => summary.uploaded += 1,
                Err(e) if e.aborts_cycle() => {
                    if e.consumes_attempt() {
                        self.record_failure(&record, &e).await?;
                    }
                    warn!(entity = %T::KIND, error = %e, "Upload pass aborted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        entity = %T::KIND,
                        local_id = %record.local_id(),
                        error = %e,
                        "Record upload failed"
                    );
                    self.record_failure(&record, &e).await?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            entity = %T::KIND,
            uploaded = summary.uploaded,
            failed = summary.failed,
            "Upload pass complete"
        );
        Ok(summary)
    }

    /// Bulk upload in chunks (initial seed). Records in committed chunks are
    /// marked `synced`; records in failed chunks are left as they were.
    /// Records that break the upload contract are reported as rejected (and
    /// parked if stored); the rest are still uploaded.
    pub async fn upload_all(&self, records: Vec<T>) -> SyncResult<BatchReport> {
        let mut prepared = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            let original = record.clone();
            match self.prepare_for_upload(record).await {
                Ok(record) => prepared.push(record),
                Err(e) if e.aborts_cycle() => return Err(e),
                Err(error) => {
                    warn!(
                        entity = %T::KIND,
                        local_id = %original.local_id(),
                        error = %error,
                        "Record rejected from bulk upload"
                    );
                    self.record_failure(&original, &error).await?;
                    rejected.push(RecordRejection {
                        local_id: original.local_id().to_string(),
                        error,
                    });
                }
            }
        }

        let mut report = self.uploader.upload(&prepared).await?;
        rejected.append(&mut report.rejected);
        report.rejected = rejected;

        let committed: Vec<T> = prepared
            .into_iter()
            .filter(|r| report.committed.iter().any(|id| id == r.local_id()))
            .collect();
        self.commit_uploaded(committed).await?;

        info!(
            entity = %T::KIND,
            committed = report.committed.len(),
            failed_chunks = report.failed.len(),
            rejected = report.rejected.len(),
            "Bulk upload finished"
        );
        Ok(report)
    }

    /// Checks the upload contract and fills in the tenant.
    async fn prepare_for_upload(&self, mut record: T) -> SyncResult<T> {
        let tenant = self.ctx.session.tenant_id().await?;

        if record.local_id().is_empty() {
            return Err(SyncError::MissingIdentifier { entity: T::KIND });
        }

        let meta = record.meta_mut();
        if meta.tenant_id.is_empty() {
            meta.tenant_id = tenant;
        } else if meta.tenant_id != tenant {
            return Err(SyncError::Conflict(format!(
                "{} {} belongs to tenant {} but the session is for {}",
                T::KIND,
                meta.local_id,
                meta.tenant_id,
                tenant
            )));
        }

        record.validate()?;
        Ok(record)
    }

    /// Stores uploaded records as `synced`, skipping any that changed
    /// locally while the upload was in flight.
    async fn commit_uploaded(&self, uploaded: Vec<T>) -> SyncResult<Vec<T>> {
        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let mut to_save = Vec::with_capacity(uploaded.len());
        let mut result = Vec::with_capacity(uploaded.len());

        for mut record in uploaded {
            match records.get::<T>(record.local_id()).await? {
                Some(current) if current.meta().updated_at != record.meta().updated_at => {
                    debug!(
                        entity = %T::KIND,
                        local_id = %record.local_id(),
                        "Record changed during upload; keeping newer edit pending"
                    );
                    result.push(current);
                }
                _ => {
                    record.meta_mut().mark_synced();
                    to_save.push(record.clone());
                    result.push(record);
                }
            }
        }

        records.save_all(&to_save).await?;
        Ok(result)
    }

    /// Applies a failed upload to the stored copy of `record`.
    async fn record_failure(&self, record: &T, error: &SyncError) -> SyncResult<()> {
        if !error.consumes_attempt() {
            return Ok(());
        }

        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let Some(mut current) = records.get::<T>(record.local_id()).await? else {
            return Ok(());
        };
        if current.meta().updated_at != record.meta().updated_at {
            // A newer edit reset the budget already.
            return Ok(());
        }

        let status = current.meta_mut().record_failure(
            &error.to_string(),
            error.is_record_fatal(),
            &self.ctx.retry,
            Utc::now(),
        );
        records.save(&current).await?;

        if status == SyncStatus::Failed {
            warn!(
                entity = %T::KIND,
                local_id = %current.local_id(),
                attempts = current.meta().sync_attempts,
                error = %error,
                "Record parked as failed"
            );
            self.ctx
                .emitter
                .emit_error(&format!("{} {}: {error}", T::KIND, current.local_id()), false);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Download
    // -------------------------------------------------------------------------

    /// Pulls the tenant's live rows, then tombstones since the last cursor,
    /// and merges each through the identity and conflict resolvers.
    pub async fn download(&self) -> SyncResult<MergeSummary> {
        let _flag = SyncingFlag::raise(&self.is_syncing);
        let tenant = self.ctx.session.tenant_id().await?;
        let table = T::KIND.table();
        let mut summary = MergeSummary::default();

        let live = self
            .ctx
            .cloud
            .select(table, &tenant, &CloudFilter::live())
            .await?;
        self.merge_rows(live, &mut summary).await?;

        let cursors = self.ctx.db.cursors();
        let since = cursors
            .get(T::KIND, TOMBSTONE_CURSOR)
            .await?
            .map(|at| at - Duration::seconds(TOMBSTONE_OVERLAP_SECS));
        let tombstones = self
            .ctx
            .cloud
            .select(table, &tenant, &CloudFilter::tombstones_since(since))
            .await?;

        // Rows without a backend stamp leave the cursor unset: full pulls.
        let newest_write = tombstones
            .iter()
            .filter_map(|row| row.get(SYNCED_AT).cloned())
            .filter_map(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
            .max();
        self.merge_rows(tombstones, &mut summary).await?;

        if let Some(at) = newest_write {
            cursors.set(T::KIND, TOMBSTONE_CURSOR, at).await?;
        }

        *self.last_sync_date.write().await = Some(Utc::now());
        info!(
            entity = %T::KIND,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            kept_local = summary.kept_local,
            "Download complete"
        );
        Ok(summary)
    }

    async fn merge_rows(&self, rows: Vec<Value>, summary: &mut MergeSummary) -> SyncResult<()> {
        for row in rows {
            match from_cloud_row::<T>(row) {
                Ok(remote) => summary.record(self.merge_remote(remote).await?),
                Err(e) => {
                    warn!(entity = %T::KIND, error = %e, "Skipping undecodable Cloud row");
                    summary.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Merges one Cloud version into the local store.
    ///
    /// Safe to call repeatedly and concurrently with other merges for the
    /// same record.
    pub async fn merge_remote(&self, mut remote: T) -> SyncResult<MergeOutcome> {
        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let local = match self.identity.resolve(&remote, true).await? {
            Resolution::New => {
                if remote.meta().is_deleted() {
                    return Ok(MergeOutcome::Ignored);
                }
                remote.meta_mut().mark_synced();
                records.save(&remote).await?;
                self.after_store(&remote);
                return Ok(MergeOutcome::Created);
            }
            Resolution::Existing { record, .. } => record,
        };

        if self.ctx.resolver.resolve(local.meta(), remote.meta()) == Winner::Local {
            debug!(entity = %T::KIND, local_id = %local.local_id(), "Local version wins");
            return Ok(MergeOutcome::KeptLocal);
        }

        if remote.meta().is_deleted() {
            records.hard_delete::<T>(local.local_id()).await?;
            info!(entity = %T::KIND, local_id = %local.local_id(), "Applied remote tombstone");
            return Ok(MergeOutcome::Deleted);
        }

        // Matched by external_ref or match key: the local id stays
        // authoritative here.
        let same_id = remote.local_id() == local.local_id();
        {
            let meta = remote.meta_mut();
            meta.local_id = local.meta().local_id.clone();
            if meta.external_ref.is_none() {
                meta.external_ref = local.meta().external_ref.clone();
            }
        }

        if same_id {
            remote.meta_mut().mark_synced();
            if local.meta().sync_status == SyncStatus::Synced
                && to_cloud_row(&local)? == to_cloud_row(&remote)?
            {
                return Ok(MergeOutcome::Unchanged);
            }
        } else {
            // Another device's row for the same object. Only new content is
            // pushed back under our id.
            if same_content(&local, &remote)? {
                return Ok(MergeOutcome::Unchanged);
            }
            remote.meta_mut().reset_for_retry();
        }

        records.save(&remote).await?;
        self.after_store(&remote);
        Ok(MergeOutcome::Updated)
    }

    fn after_store(&self, record: &T) {
        if let Some(alert) = record.low_stock_alert() {
            self.ctx.emitter.emit_low_stock(&alert);
        }
    }

    // -------------------------------------------------------------------------
    // Local Mutations
    // -------------------------------------------------------------------------

    /// Saves a local edit: stamps `updated_at`, marks `pending`.
    pub async fn save_local(&self, mut record: T) -> SyncResult<T> {
        record.validate_entry()?;

        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        if record.meta().tenant_id.is_empty() {
            if let Ok(tenant) = self.ctx.session.tenant_id().await {
                record.meta_mut().tenant_id = tenant;
            }
        }
        if let Some(stored) = records.get::<T>(record.local_id()).await? {
            // Never step behind the stored version.
            let meta = record.meta_mut();
            if stored.meta().updated_at > meta.updated_at {
                meta.updated_at = stored.meta().updated_at;
            }
        }

        record.meta_mut().touch(Utc::now());
        records.save(&record).await?;

        debug!(entity = %T::KIND, local_id = %record.local_id(), "Saved local edit");
        Ok(record)
    }

    /// Tombstones a record locally. The tombstone uploads like any edit.
    pub async fn delete_local(&self, local_id: &str) -> SyncResult<Option<T>> {
        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let Some(mut record) = records.get::<T>(local_id).await? else {
            return Ok(None);
        };
        if !record.meta().is_deleted() {
            record.meta_mut().tombstone(Utc::now());
            records.save(&record).await?;
            info!(entity = %T::KIND, local_id, "Deleted locally");
        }
        Ok(Some(record))
    }

    pub async fn get(&self, local_id: &str) -> SyncResult<Option<T>> {
        Ok(self.ctx.db.records().get::<T>(local_id).await?)
    }

    pub async fn get_by_external_ref(&self, external_ref: &str) -> SyncResult<Option<T>> {
        Ok(self
            .ctx
            .db
            .records()
            .find_by_external_ref::<T>(external_ref)
            .await?)
    }

    // -------------------------------------------------------------------------
    // Operator Surface
    // -------------------------------------------------------------------------

    /// Records parked as `failed`.
    pub async fn failed_records(&self) -> SyncResult<Vec<T>> {
        let query = RecordQuery::all()
            .with_status(SyncStatus::Failed)
            .including_deleted();
        Ok(self.ctx.db.records().list::<T>(&query).await?)
    }

    /// Puts every failed record back in the upload queue.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let query = RecordQuery::all()
            .with_status(SyncStatus::Failed)
            .including_deleted();
        let mut failed = records.list::<T>(&query).await?;
        for record in &mut failed {
            record.meta_mut().reset_for_retry();
        }
        records.save_all(&failed).await?;

        if !failed.is_empty() {
            info!(entity = %T::KIND, count = failed.len(), "Failed records queued for retry");
        }
        Ok(failed.len())
    }

    pub async fn pending_count(&self) -> SyncResult<i64> {
        Ok(self
            .ctx
            .db
            .records()
            .count_with_status::<T>(SyncStatus::Pending)
            .await?)
    }

    pub async fn failed_count(&self) -> SyncResult<i64> {
        Ok(self
            .ctx
            .db
            .records()
            .count_with_status::<T>(SyncStatus::Failed)
            .await?)
    }
}

// =============================================================================
// POS Import
// =============================================================================

impl<T: FromPos> EntitySyncer<T> {
    fn pos(&self) -> SyncResult<&Arc<dyn PosPlatform>> {
        self.ctx
            .pos
            .as_ref()
            .ok_or_else(|| SyncError::InvalidConfig("POS platform is not configured".into()))
    }

    /// Pages through the POS collection and merges every object.
    pub async fn import_from_pos(&self) -> SyncResult<MergeSummary> {
        let pos = self.pos()?;
        let tenant = self.ctx.session.tenant_id().await?;
        let mut summary = MergeSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = pos.list(T::COLLECTION, cursor.as_deref()).await?;
            for object in page.objects {
                match T::decode_pos(object) {
                    Ok(dto) => summary.record(self.merge_pos(&dto, &tenant).await?),
                    Err(e) => {
                        warn!(entity = %T::KIND, error = %e, "Skipping undecodable POS object");
                        summary.skipped += 1;
                    }
                }
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(
            entity = %T::KIND,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            "POS import complete"
        );
        Ok(summary)
    }

    /// Targeted re-sync of one POS object (webhook path).
    ///
    /// A POS 404 tombstones the local mirror. Objects never mirrored are
    /// imported only when `import_unknown` is set.
    pub async fn resync_pos_object(
        &self,
        pos_id: &str,
        import_unknown: bool,
    ) -> SyncResult<MergeOutcome> {
        let pos = self.pos()?;
        let tenant = self.ctx.session.tenant_id().await?;

        let known = self
            .ctx
            .db
            .records()
            .find_by_external_ref::<T>(pos_id)
            .await?
            .is_some();

        match pos.fetch(T::COLLECTION, pos_id).await? {
            Some(raw) => {
                if !known && !import_unknown {
                    debug!(entity = %T::KIND, pos_id, "Ignoring unknown POS object");
                    return Ok(MergeOutcome::Ignored);
                }
                let dto = T::decode_pos(raw)?;
                self.merge_pos(&dto, &tenant).await
            }
            None if known => self.tombstone_pos_object(pos_id).await,
            None => Ok(MergeOutcome::Ignored),
        }
    }

    async fn tombstone_pos_object(&self, pos_id: &str) -> SyncResult<MergeOutcome> {
        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let Some(mut record) = records.find_by_external_ref::<T>(pos_id).await? else {
            return Ok(MergeOutcome::Ignored);
        };
        if record.meta().is_deleted() {
            return Ok(MergeOutcome::Unchanged);
        }

        record.meta_mut().tombstone(Utc::now());
        records.save(&record).await?;
        info!(entity = %T::KIND, pos_id, local_id = %record.local_id(), "POS object gone; tombstoned");
        Ok(MergeOutcome::Deleted)
    }

    /// Merges one POS object. Winners are stored `pending` so the Cloud
    /// mirror receives them.
    async fn merge_pos(&self, dto: &T::Dto, tenant: &str) -> SyncResult<MergeOutcome> {
        let pos_id = T::pos_id(dto).to_string();
        let now = Utc::now();
        let remote_at = T::pos_updated_at(dto).unwrap_or(now);
        let pos_deleted = T::pos_is_deleted(dto);

        let mut candidate_meta = SyncMeta::new(tenant);
        candidate_meta.updated_at = remote_at;
        candidate_meta.external_ref = Some(pos_id.clone());
        let candidate = T::from_pos(dto, candidate_meta);

        let _lane = self.ctx.write_lane.lock().await;
        let records = self.ctx.db.records();

        let local = match self.identity.resolve(&candidate, false).await? {
            Resolution::New => {
                if pos_deleted {
                    return Ok(MergeOutcome::Ignored);
                }
                records.save(&candidate).await?;
                self.after_store(&candidate);
                debug!(entity = %T::KIND, pos_id, "Imported new POS object");
                return Ok(MergeOutcome::Created);
            }
            Resolution::Existing { record, .. } => record,
        };

        let mut remote = local.clone();
        remote.apply_pos(dto);
        {
            let meta = remote.meta_mut();
            meta.external_ref = Some(pos_id);
            meta.updated_at = remote_at;
            if pos_deleted && meta.deleted_at.is_none() {
                meta.deleted_at = Some(remote_at);
            }
        }

        if self.ctx.resolver.resolve(local.meta(), remote.meta()) == Winner::Local {
            return Ok(MergeOutcome::KeptLocal);
        }

        if same_content(&local, &remote)? {
            return Ok(MergeOutcome::Unchanged);
        }

        // Stamp as a local mutation so the Cloud copy is overwritten.
        let meta = remote.meta_mut();
        meta.updated_at = remote_at.max(local.meta().updated_at);
        meta.touch(now);
        if pos_deleted {
            meta.deleted_at = Some(meta.updated_at);
        }

        records.save(&remote).await?;
        self.after_store(&remote);
        Ok(if pos_deleted {
            MergeOutcome::Deleted
        } else {
            MergeOutcome::Updated
        })
    }
}

/// Compares Cloud rows ignoring timestamps.
fn same_content<T: SyncableRecord>(a: &T, b: &T) -> SyncResult<bool> {
    let strip = |record: &T| -> SyncResult<Value> {
        let mut row = to_cloud_row(record)?;
        if let Value::Object(ref mut map) = row {
            map.remove("updated_at");
            let deleted = map.remove("deleted_at").is_some_and(|v| !v.is_null());
            map.insert("deleted".into(), Value::Bool(deleted));
        }
        Ok(row)
    };
    Ok(strip(a)? == strip(b)?)
}

// =============================================================================
// Inventory
// =============================================================================

impl EntitySyncer<InventoryItem> {
    /// Adjusts on-hand stock and uploads the item immediately.
    ///
    /// The local change is persisted first. If the write-through upload
    /// fails the item stays `pending` (or `failed`, for record-level
    /// errors) and the next cycle picks it up; the returned item shows
    /// which.
    pub async fn adjust_stock(
        &self,
        local_id: &str,
        delta: i64,
        reason: Option<&str>,
    ) -> SyncResult<InventoryItem> {
        let item = {
            let _lane = self.ctx.write_lane.lock().await;
            let records = self.ctx.db.records();

            let mut item = records
                .get::<InventoryItem>(local_id)
                .await?
                .filter(|i| !i.meta.is_deleted())
                .ok_or_else(|| SyncError::RecordNotFound {
                    entity: InventoryItem::KIND,
                    local_id: local_id.to_string(),
                })?;

            item.quantity += delta;
            item.meta.touch(Utc::now());
            records.save(&item).await?;
            item
        };

        let event = AuditEvent::StockAdjusted {
            local_id: item.meta.local_id.clone(),
            sku: item.sku.clone(),
            delta,
            quantity: item.quantity,
            reason: reason.map(str::to_string),
            at: item.meta.updated_at,
        };
        self.ctx.emitter.emit_audit(&event);
        info!(local_id, sku = %item.sku, delta, quantity = item.quantity, "Stock adjusted");

        match self.upload(item.clone()).await {
            Ok(synced) => Ok(synced),
            Err(e) => {
                warn!(local_id, error = %e, "Write-through upload failed; will retry next cycle");
                self.record_failure(&item, &e).await?;
                Ok(self.get(local_id).await?.unwrap_or(item))
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::PosCollection;
    use crate::test_support::{memory_db, FakeCloud, FakePos, RecordingEmitter, TENANT};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tally_core::{ConflictStrategy, Customer, Payment, PaymentMethod};

    struct Harness {
        db: Database,
        cloud: Arc<FakeCloud>,
        pos: Arc<FakePos>,
        emitter: Arc<RecordingEmitter>,
        ctx: SyncContext,
    }

    async fn harness_with(strategy: ConflictStrategy) -> Harness {
        let db = memory_db().await;
        let cloud = Arc::new(FakeCloud::new());
        let pos = Arc::new(FakePos::new());
        let emitter = RecordingEmitter::new();
        let settings = SyncSettings {
            conflict_strategy: strategy,
            ..SyncSettings::default()
        };
        let ctx = SyncContext::new(
            db.clone(),
            cloud.clone(),
            SessionContext::with_tenant(TENANT),
            &settings,
        )
        .with_pos(pos.clone())
        .with_emitter(emitter.clone());

        Harness {
            db,
            cloud,
            pos,
            emitter,
            ctx,
        }
    }

    async fn harness() -> Harness {
        harness_with(ConflictStrategy::NewestWins).await
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn customer_at(local_id: &str, name: &str, secs: i64) -> Customer {
        let mut c = Customer::new(TENANT, name);
        c.meta = SyncMeta::with_id(local_id, TENANT, at(secs));
        c
    }

    // -------------------------------------------------------------------------
    // Upload
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_marks_synced() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let c = syncer.save_local(Customer::new("", "Ada")).await.unwrap();
        assert_eq!(c.meta.tenant_id, TENANT);

        let synced = syncer.upload(c.clone()).await.unwrap();

        assert_eq!(synced.meta.sync_status, SyncStatus::Synced);
        let row = h.cloud.row("customers", c.local_id()).unwrap();
        assert_eq!(row["given_name"], "Ada");
        assert_eq!(row["tenant_id"], TENANT);
        assert!(row.get("sync_status").is_none());
        assert_eq!(syncer.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idempotent_upsert() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let c = syncer.save_local(Customer::new(TENANT, "Ada")).await.unwrap();

        let first = syncer.upload(c.clone()).await.unwrap();
        let remote_after_first = h.cloud.row("customers", c.local_id()).unwrap();

        let second = syncer.upload(first.clone()).await.unwrap();
        let remote_after_second = h.cloud.row("customers", c.local_id()).unwrap();

        assert_eq!(remote_after_first, remote_after_second);
        assert_eq!(h.cloud.row_count("customers"), 1);
        assert_eq!(first, second);
        let stored: Customer = h.db.records().get(c.local_id()).await.unwrap().unwrap();
        assert_eq!(stored, second);
    }

    #[tokio::test]
    async fn test_upload_without_tenant_is_not_authenticated() {
        let h = harness().await;
        let ctx = SyncContext::new(
            h.db.clone(),
            h.cloud.clone(),
            SessionContext::default(),
            &SyncSettings::default(),
        );
        let syncer = EntitySyncer::<Customer>::new(ctx);

        let err = syncer.upload(Customer::new("", "Ada")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated(_)));
        assert_eq!(h.cloud.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_without_local_id_is_contract_violation() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut c = Customer::new(TENANT, "Ada");
        c.meta.local_id.clear();

        let err = syncer.upload(c).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingIdentifier { .. }));
        assert!(err.is_record_fatal());
    }

    #[tokio::test]
    async fn test_upload_for_other_tenant_is_conflict() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());

        let err = syncer
            .upload(Customer::new("other-shop", "Ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_pending_pass_continues_past_record_fatal_errors() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let a = syncer.save_local(customer_at("a", "A", 1)).await.unwrap();
        let b = syncer.save_local(customer_at("b", "B", 2)).await.unwrap();
        h.cloud
            .fail_upsert_call(1, SyncError::from_status(422, "bad row"));

        let summary = syncer.upload_pending_changes().await.unwrap();

        assert_eq!(summary, UploadSummary { uploaded: 1, failed: 1 });
        let failed = syncer.failed_records().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].local_id(), a.local_id());
        assert!(failed[0].meta.last_sync_error.is_some());
        assert!(h.cloud.row("customers", b.local_id()).is_some());
        assert_eq!(h.emitter.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_network_error_aborts_pass_without_consuming_attempts() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        syncer.save_local(customer_at("a", "A", 1)).await.unwrap();
        syncer.save_local(customer_at("b", "B", 2)).await.unwrap();
        h.cloud.set_offline(true);

        let err = syncer.upload_pending_changes().await.unwrap_err();

        assert!(matches!(err, SyncError::Network(_)));
        assert_eq!(h.cloud.upsert_calls(), 1);
        assert_eq!(syncer.pending_count().await.unwrap(), 2);
        let a: Customer = h.db.records().get("a").await.unwrap().unwrap();
        assert_eq!(a.meta.sync_attempts, 0);
    }

    #[tokio::test]
    async fn test_server_error_backs_off_then_parks() {
        let h = harness().await;
        let mut ctx = h.ctx.clone();
        ctx.retry = RetryPolicy {
            max_attempts: 2,
            initial_delay_secs: 0,
            max_delay_secs: 0,
        };
        let syncer = EntitySyncer::<Customer>::new(ctx);
        syncer.save_local(customer_at("a", "A", 1)).await.unwrap();

        h.cloud.fail_upsert_call(1, SyncError::from_status(503, "down"));
        assert!(syncer.upload_pending_changes().await.is_err());
        let a: Customer = h.db.records().get("a").await.unwrap().unwrap();
        assert_eq!(a.meta.sync_status, SyncStatus::Pending);
        assert_eq!(a.meta.sync_attempts, 1);

        h.cloud.fail_upsert_call(2, SyncError::from_status(503, "down"));
        assert!(syncer.upload_pending_changes().await.is_err());
        let a: Customer = h.db.records().get("a").await.unwrap().unwrap();
        assert_eq!(a.meta.sync_status, SyncStatus::Failed);

        assert_eq!(syncer.retry_failed().await.unwrap(), 1);
        let summary = syncer.upload_pending_changes().await.unwrap();
        assert_eq!(summary.uploaded, 1);
    }

    #[tokio::test]
    async fn test_partial_bulk_upload_leaves_failed_chunk_pending() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());

        let mut items = Vec::new();
        for i in 0..250 {
            let item = InventoryItem::new(TENANT, format!("SKU-{i:03}"), format!("Item {i}"), 100);
            items.push(syncer.save_local(item).await.unwrap());
        }
        h.cloud
            .fail_upsert_call(2, SyncError::from_status(503, "unavailable"));

        let report = syncer.upload_all(items.clone()).await.unwrap();

        assert_eq!(report.committed.len(), 150);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(h.cloud.row_count("inventory_items"), 150);

        for (i, item) in items.iter().enumerate() {
            let stored: InventoryItem = h.db.records().get(item.local_id()).await.unwrap().unwrap();
            let in_chunk_two = (100..200).contains(&i);
            assert_eq!(h.cloud.row("inventory_items", item.local_id()).is_some(), !in_chunk_two);
            let expected = if in_chunk_two {
                SyncStatus::Pending
            } else {
                SyncStatus::Synced
            };
            assert_eq!(stored.meta.sync_status, expected, "item {i}");
        }
    }

    #[tokio::test]
    async fn test_bulk_upload_rejects_invalid_records_and_sends_the_rest() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());

        let mut items = Vec::new();
        for i in 0..10 {
            let item = InventoryItem::new(TENANT, format!("SKU-{i:03}"), format!("Item {i}"), 100);
            items.push(syncer.save_local(item).await.unwrap());
        }
        // Corrupted in the store after entry.
        items[5].price_cents = -1;
        h.db.records().save(&items[5]).await.unwrap();

        let report = syncer.upload_all(items.clone()).await.unwrap();

        assert_eq!(report.committed.len(), 9);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].local_id, items[5].local_id());
        assert!(matches!(report.rejected[0].error, SyncError::Validation(_)));
        assert!(!report.is_complete());
        assert_eq!(h.cloud.row_count("inventory_items"), 9);
        assert!(h.cloud.row("inventory_items", items[5].local_id()).is_none());

        let failed = syncer.failed_records().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].local_id(), items[5].local_id());
    }

    #[tokio::test]
    async fn test_bulk_upload_without_tenant_fails_whole() {
        let h = harness().await;
        let ctx = SyncContext::new(
            h.db.clone(),
            h.cloud.clone(),
            SessionContext::default(),
            &SyncSettings::default(),
        );
        let syncer = EntitySyncer::<InventoryItem>::new(ctx);
        let item = InventoryItem::new(TENANT, "SKU-1", "Item", 100);

        let err = syncer.upload_all(vec![item]).await.unwrap_err();

        assert!(matches!(err, SyncError::NotAuthenticated(_)));
        assert_eq!(h.cloud.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_edit_during_upload_stays_pending() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let original = syncer.save_local(Customer::new(TENANT, "Ada")).await.unwrap();

        let mut edited = original.clone();
        edited.given_name = "Ada L.".into();
        syncer.save_local(edited).await.unwrap();

        // Commit of the stale upload must not mark the newer edit synced.
        let result = syncer.upload(original.clone()).await.unwrap();
        assert_eq!(result.given_name, "Ada L.");
        assert_eq!(result.meta.sync_status, SyncStatus::Pending);
    }

    // -------------------------------------------------------------------------
    // Download / Merge
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_download_creates_synced_records() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let remote = customer_at("r1", "Remote", 5);
        h.cloud.insert_row("customers", to_cloud_row(&remote).unwrap());

        let summary = syncer.download().await.unwrap();

        assert_eq!(summary.created, 1);
        let stored: Customer = h.db.records().get("r1").await.unwrap().unwrap();
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert!(syncer.last_sync_date().await.is_some());
        assert!(!syncer.is_syncing());

        // Second download is a no-op.
        let again = syncer.download().await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.changed(), 0);
    }

    #[tokio::test]
    async fn test_download_ignores_other_tenants() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut other = customer_at("o1", "Other", 5);
        other.meta.tenant_id = "shop-2".into();
        h.cloud.insert_row("customers", to_cloud_row(&other).unwrap());

        let summary = syncer.download().await.unwrap();
        assert_eq!(summary.created, 0);
        assert!(h.db.records().get::<Customer>("o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newest_wins_keeps_newer_local_edit() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Local", 10);
        local.meta.sync_status = SyncStatus::Pending;
        h.db.records().save(&local).await.unwrap();

        let outcome = syncer.merge_remote(customer_at("c1", "Remote", 5)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::KeptLocal);

        let outcome = syncer.merge_remote(customer_at("c1", "Remote", 20)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);
        let stored: Customer = h.db.records().get("c1").await.unwrap().unwrap();
        assert_eq!(stored.given_name, "Remote");
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_server_wins_overrides_pending_local() {
        let h = harness_with(ConflictStrategy::ServerWins).await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Local", 10);
        local.meta.sync_status = SyncStatus::Pending;
        h.db.records().save(&local).await.unwrap();

        let outcome = syncer.merge_remote(customer_at("c1", "Remote", 5)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);
    }

    #[tokio::test]
    async fn test_local_wins_keeps_pending_local() {
        let h = harness_with(ConflictStrategy::LocalWins).await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Local", 1);
        local.meta.sync_status = SyncStatus::Pending;
        h.db.records().save(&local).await.unwrap();

        let outcome = syncer.merge_remote(customer_at("c1", "Remote", 50)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::KeptLocal);
    }

    #[tokio::test]
    async fn test_equal_timestamps_remote_wins() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Local", 10);
        local.meta.sync_status = SyncStatus::Pending;
        h.db.records().save(&local).await.unwrap();

        let outcome = syncer.merge_remote(customer_at("c1", "Remote", 10)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);
    }

    #[tokio::test]
    async fn test_convergence_regardless_of_order() {
        let versions: Vec<Customer> = [(3, "v3"), (1, "v1"), (2, "v2")]
            .into_iter()
            .map(|(t, name)| customer_at("c1", name, t))
            .collect();

        let a = harness().await;
        let b = harness().await;
        let sa = EntitySyncer::<Customer>::new(a.ctx.clone());
        let sb = EntitySyncer::<Customer>::new(b.ctx.clone());

        // Each replica starts with its own unsynced local edit.
        let mut local_a = customer_at("c1", "local-a", 2);
        local_a.meta.sync_status = SyncStatus::Pending;
        a.db.records().save(&local_a).await.unwrap();
        let mut local_b = customer_at("c1", "local-b", 0);
        local_b.meta.sync_status = SyncStatus::Pending;
        b.db.records().save(&local_b).await.unwrap();

        for v in versions.iter() {
            sa.merge_remote(v.clone()).await.unwrap();
        }
        for v in versions.iter().rev() {
            sb.merge_remote(v.clone()).await.unwrap();
        }

        let ra: Customer = a.db.records().get("c1").await.unwrap().unwrap();
        let rb: Customer = b.db.records().get("c1").await.unwrap().unwrap();
        assert_eq!(ra.given_name, "v3");
        assert_eq!(rb.given_name, "v3");
        assert_eq!(ra.meta.updated_at, rb.meta.updated_at);
    }

    #[tokio::test]
    async fn test_remote_tombstone_hard_deletes_and_advances_cursor() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Ada", 1);
        local.meta.mark_synced();
        h.db.records().save(&local).await.unwrap();

        let mut tomb = customer_at("c1", "Ada", 5);
        tomb.meta.deleted_at = Some(at(5));
        h.cloud.insert_row("customers", to_cloud_row(&tomb).unwrap());

        let summary = syncer.download().await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(h.db.records().get::<Customer>("c1").await.unwrap().is_none());
        let cursor = h
            .db
            .cursors()
            .get(Customer::KIND, TOMBSTONE_CURSOR)
            .await
            .unwrap();
        assert_eq!(cursor, h.cloud.synced_at("customers", "c1"));
    }

    #[tokio::test]
    async fn test_old_tombstone_uploaded_late_is_still_applied() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        for id in ["c1", "c2"] {
            let mut local = customer_at(id, "Ada", 1);
            local.meta.mark_synced();
            h.db.records().save(&local).await.unwrap();
        }

        let mut newer = customer_at("c2", "Ada", 50);
        newer.meta.deleted_at = Some(at(50));
        h.cloud.insert_row("customers", to_cloud_row(&newer).unwrap());
        syncer.download().await.unwrap();
        assert!(h.db.records().get::<Customer>("c2").await.unwrap().is_none());

        // Deleted offline at t5, reaches the Cloud only now.
        let mut older = customer_at("c1", "Ada", 5);
        older.meta.deleted_at = Some(at(5));
        h.cloud.insert_row("customers", to_cloud_row(&older).unwrap());

        let summary = syncer.download().await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(h.db.records().get::<Customer>("c1").await.unwrap().is_none());
    }

    /// Cloud that never exposes the backend write stamp.
    struct UnstampedCloud(Arc<FakeCloud>);

    #[async_trait::async_trait]
    impl CloudBackend for UnstampedCloud {
        async fn upsert(&self, table: &str, rows: &[Value]) -> SyncResult<()> {
            self.0.upsert(table, rows).await
        }

        async fn select(
            &self,
            table: &str,
            tenant_id: &str,
            filter: &CloudFilter,
        ) -> SyncResult<Vec<Value>> {
            let mut rows = self.0.select(table, tenant_id, filter).await?;
            for row in &mut rows {
                if let Value::Object(map) = row {
                    map.remove(SYNCED_AT);
                }
            }
            Ok(rows)
        }

        async fn ping(&self) -> SyncResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_without_write_stamps_every_tombstone_is_pulled() {
        let db = memory_db().await;
        let cloud = Arc::new(FakeCloud::new());
        let ctx = SyncContext::new(
            db.clone(),
            Arc::new(UnstampedCloud(cloud.clone())),
            SessionContext::with_tenant(TENANT),
            &SyncSettings::default(),
        );
        let syncer = EntitySyncer::<Customer>::new(ctx);

        let mut newer = customer_at("c2", "Ada", 50);
        newer.meta.deleted_at = Some(at(50));
        cloud.insert_row("customers", to_cloud_row(&newer).unwrap());
        syncer.download().await.unwrap();
        assert!(db
            .cursors()
            .get(Customer::KIND, TOMBSTONE_CURSOR)
            .await
            .unwrap()
            .is_none());

        let mut local = customer_at("c1", "Ada", 1);
        local.meta.mark_synced();
        db.records().save(&local).await.unwrap();
        let mut older = customer_at("c1", "Ada", 5);
        older.meta.deleted_at = Some(at(5));
        cloud.insert_row("customers", to_cloud_row(&older).unwrap());

        let summary = syncer.download().await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(db.records().get::<Customer>("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_local_edit_survives_remote_tombstone() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c1", "Ada", 10);
        local.meta.sync_status = SyncStatus::Pending;
        h.db.records().save(&local).await.unwrap();

        let mut tomb = customer_at("c1", "Ada", 5);
        tomb.meta.deleted_at = Some(at(5));

        assert_eq!(syncer.merge_remote(tomb).await.unwrap(), MergeOutcome::KeptLocal);
        assert!(h.db.records().get::<Customer>("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tombstone_for_unknown_record_is_ignored() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut tomb = customer_at("ghost", "Ghost", 5);
        tomb.meta.deleted_at = Some(at(5));

        assert_eq!(syncer.merge_remote(tomb).await.unwrap(), MergeOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_low_stock_alert_after_merge() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        let mut item = InventoryItem::new(TENANT, "SKU-1", "Screen", 100);
        item.quantity = 1;
        item.min_quantity = 2;

        syncer.merge_remote(item).await.unwrap();

        let alerts = h.emitter.low_stock.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].sku, "SKU-1");
    }

    // -------------------------------------------------------------------------
    // Local Mutations
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_local_delete_uploads_tombstone() {
        let h = harness().await;
        let syncer = EntitySyncer::<Payment>::new(h.ctx.clone());
        let p = syncer
            .save_local(Payment::new(TENANT, PaymentMethod::Cash, 1500))
            .await
            .unwrap();
        syncer.upload_pending_changes().await.unwrap();

        let deleted = syncer.delete_local(p.local_id()).await.unwrap().unwrap();
        assert!(deleted.meta.is_deleted());
        assert_eq!(deleted.meta.sync_status, SyncStatus::Pending);

        syncer.upload_pending_changes().await.unwrap();
        let row = h.cloud.row("payments", p.local_id()).unwrap();
        assert!(!row["deleted_at"].is_null());
    }

    #[tokio::test]
    async fn test_save_local_rejects_invalid_record() {
        let h = harness().await;
        let syncer = EntitySyncer::<Payment>::new(h.ctx.clone());
        let err = syncer
            .save_local(Payment::new(TENANT, PaymentMethod::Card, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_adjust_stock_writes_through() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        let mut item = InventoryItem::new(TENANT, "SKU-1", "Screen", 100);
        item.quantity = 10;
        let item = syncer.save_local(item).await.unwrap();

        let adjusted = syncer
            .adjust_stock(item.local_id(), -3, Some("repair"))
            .await
            .unwrap();

        assert_eq!(adjusted.quantity, 7);
        assert_eq!(adjusted.meta.sync_status, SyncStatus::Synced);
        assert_eq!(h.cloud.row("inventory_items", item.local_id()).unwrap()["quantity"], 7);
        let audits = h.emitter.audits.lock().unwrap();
        assert!(matches!(
            audits[0],
            AuditEvent::StockAdjusted { delta: -3, quantity: 7, .. }
        ));
    }

    #[tokio::test]
    async fn test_adjust_stock_offline_keeps_change_pending() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        let item = syncer
            .save_local(InventoryItem::new(TENANT, "SKU-1", "Screen", 100))
            .await
            .unwrap();
        h.cloud.set_offline(true);

        let adjusted = syncer.adjust_stock(item.local_id(), 5, None).await.unwrap();

        assert_eq!(adjusted.quantity, 5);
        assert_eq!(adjusted.meta.sync_status, SyncStatus::Pending);
        assert_eq!(adjusted.meta.sync_attempts, 0);
    }

    #[tokio::test]
    async fn test_adjust_stock_unknown_item() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        let err = syncer.adjust_stock("missing", 1, None).await.unwrap_err();
        assert!(matches!(err, SyncError::RecordNotFound { .. }));
    }

    // -------------------------------------------------------------------------
    // POS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_no_duplicate_customer_by_email() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = Customer::new(TENANT, "Ada");
        local.email = Some("a@example.com".into());
        let local = syncer.save_local(local).await.unwrap();

        h.pos.put(
            PosCollection::Customers,
            json!({
                "id": "POS-C1",
                "given_name": "Ada",
                "email_address": "A@example.com",
                "updated_at": (Utc::now() + Duration::seconds(60)).to_rfc3339()
            }),
        );

        let summary = syncer.import_from_pos().await.unwrap();
        assert_eq!(summary.created, 0);

        let all = h
            .db
            .records()
            .list::<Customer>(&RecordQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id(), local.local_id());
        assert_eq!(all[0].external_ref(), Some("POS-C1"));
    }

    #[tokio::test]
    async fn test_cloud_row_from_other_device_merges_by_email() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        let mut local = customer_at("c-local", "Ada", 1);
        local.email = Some("a@example.com".into());
        local.meta.mark_synced();
        h.db.records().save(&local).await.unwrap();

        let mut other = customer_at("c-other", "Ada L.", 10);
        other.email = Some("A@example.com".into());
        h.cloud.insert_row("customers", to_cloud_row(&other).unwrap());

        let summary = syncer.download().await.unwrap();

        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 1);
        let all = h
            .db
            .records()
            .list::<Customer>(&RecordQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id(), "c-local");
        assert_eq!(all[0].given_name, "Ada L.");
        assert_eq!(all[0].meta.sync_status, SyncStatus::Pending);

        // Pushed back under our id, then nothing more to do.
        syncer.upload_pending_changes().await.unwrap();
        let again = syncer.download().await.unwrap();
        assert_eq!(again.changed(), 0);
        assert_eq!(syncer.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backfilled_external_ref_reaches_cloud() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        let item = syncer
            .save_local(InventoryItem::new(TENANT, "SKU-1", "Part", 100))
            .await
            .unwrap();
        syncer.upload(item.clone()).await.unwrap();

        h.pos.put(
            PosCollection::Items,
            json!({
                "id": "POS-I1",
                "sku": "SKU-1",
                "name": "Part",
                "price_cents": 100,
                "updated_at": item.meta.updated_at.to_rfc3339()
            }),
        );
        syncer.import_from_pos().await.unwrap();
        syncer.upload_pending_changes().await.unwrap();

        let row = h.cloud.row("inventory_items", item.local_id()).unwrap();
        assert_eq!(row["external_ref"], "POS-I1");
    }

    #[tokio::test]
    async fn test_import_pages_through_pos() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        for i in 0..5 {
            h.pos.put(
                PosCollection::Items,
                json!({ "id": format!("I{i}"), "sku": format!("SKU-{i}"), "name": "Part", "price_cents": 100 }),
            );
        }

        let summary = syncer.import_from_pos().await.unwrap();

        assert_eq!(summary.created, 5);
        assert_eq!(h.pos.list_calls(), 3);
        assert_eq!(syncer.pending_count().await.unwrap(), 5);

        // Re-import with nothing new changes nothing.
        let again = syncer.import_from_pos().await.unwrap();
        assert_eq!(again.changed(), 0);
    }

    #[tokio::test]
    async fn test_pos_sku_outside_local_format_still_uploads() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        h.pos.put(
            PosCollection::Items,
            json!({ "id": "I1", "sku": "ABC 123", "name": "Part", "price_cents": 100 }),
        );

        assert_eq!(syncer.import_from_pos().await.unwrap().created, 1);
        let summary = syncer.upload_pending_changes().await.unwrap();

        assert_eq!(summary, UploadSummary { uploaded: 1, failed: 0 });
        assert_eq!(h.cloud.row_count("inventory_items"), 1);
        assert!(syncer.failed_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resync_of_vanished_pos_object_tombstones() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());
        h.pos.put(
            PosCollection::Items,
            json!({ "id": "I1", "sku": "SKU-1", "name": "Part" }),
        );
        assert_eq!(
            syncer.resync_pos_object("I1", true).await.unwrap(),
            MergeOutcome::Created
        );

        h.pos.remove(PosCollection::Items, "I1");
        assert_eq!(
            syncer.resync_pos_object("I1", true).await.unwrap(),
            MergeOutcome::Deleted
        );

        let item: InventoryItem = h
            .db
            .records()
            .find_by_external_ref("I1")
            .await
            .unwrap()
            .unwrap();
        assert!(item.meta.is_deleted());
        assert_eq!(item.meta.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_resync_unknown_object_respects_import_flag() {
        let h = harness().await;
        let syncer = EntitySyncer::<Customer>::new(h.ctx.clone());
        h.pos.put(
            PosCollection::Customers,
            json!({ "id": "C9", "given_name": "New" }),
        );

        assert_eq!(
            syncer.resync_pos_object("C9", false).await.unwrap(),
            MergeOutcome::Ignored
        );
        assert_eq!(
            syncer.resync_pos_object("missing", true).await.unwrap(),
            MergeOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_webhook_resync_concurrent_with_download() {
        let h = harness().await;
        let syncer = EntitySyncer::<InventoryItem>::new(h.ctx.clone());

        // Another device already mirrored POS item X into the Cloud.
        let mut mirrored = InventoryItem::new(TENANT, "SKU-X", "Part X", 100);
        mirrored.meta.external_ref = Some("X".into());
        h.cloud
            .insert_row("inventory_items", to_cloud_row(&mirrored).unwrap());
        h.pos.put(
            PosCollection::Items,
            json!({ "id": "X", "sku": "SKU-X", "name": "Part X", "price_cents": 100 }),
        );

        let (download, resync) =
            tokio::join!(syncer.download(), syncer.resync_pos_object("X", true));
        download.unwrap();
        resync.unwrap();

        let all = h
            .db
            .records()
            .list::<InventoryItem>(&RecordQuery::all().including_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].external_ref(), Some("X"));
        assert!(matches!(
            all[0].meta.sync_status,
            SyncStatus::Synced | SyncStatus::Pending
        ));

        // Running both again converges without new rows.
        let (d, r) = tokio::join!(syncer.download(), syncer.resync_pos_object("X", true));
        d.unwrap();
        r.unwrap();
        let count = h
            .db
            .records()
            .list::<InventoryItem>(&RecordQuery::all().including_deleted())
            .await
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }
}
