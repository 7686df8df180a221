//! # Batch Uploader
//!
//! Pushes collections to the Cloud in fixed-size chunks, one upsert call
//! per chunk.
//!
//! ```text
//! 250 records, chunk size 100:
//!
//!   chunk 0  [  0.. 99]  ──upsert──► ok      → committed
//!   chunk 1  [100..199]  ──upsert──► 503     → failed (records untouched)
//!   chunk 2  [200..249]  ──upsert──► ok      → committed
//! ```
//!
//! **Uploads are not atomic across chunks.** A failed chunk does not roll
//! back chunks already committed, and later chunks are still attempted.
//! Callers get a [`BatchReport`] and must treat partial success as a normal
//! outcome. Only an authentication failure or shutdown stops the remaining
//! chunks. A record that cannot be turned into a row is reported as
//! rejected and the rest still go out.

use std::sync::Arc;

use tracing::{debug, warn};

use tally_core::{to_cloud_row, SyncableRecord};

use crate::cloud::CloudBackend;
use crate::error::{SyncError, SyncResult};

/// A chunk the Cloud refused.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Zero-based chunk position.
    pub index: usize,
    pub local_ids: Vec<String>,
    pub error: SyncError,
}

/// A record refused before any chunk was sent.
#[derive(Debug)]
pub struct RecordRejection {
    pub local_id: String,
    pub error: SyncError,
}

/// Outcome of a bulk upload.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Records in committed chunks.
    pub committed: Vec<String>,
    pub failed: Vec<ChunkFailure>,
    /// Records never attempted because an earlier chunk aborted the run.
    pub not_attempted: Vec<String>,
    pub rejected: Vec<RecordRejection>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty() && self.rejected.is_empty()
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failed
            .iter()
            .flat_map(|f| f.local_ids.iter().map(String::as_str))
    }
}

/// Chunked Cloud upserts.
#[derive(Clone)]
pub struct BatchUploader {
    cloud: Arc<dyn CloudBackend>,
    chunk_size: usize,
}

impl BatchUploader {
    pub fn new(cloud: Arc<dyn CloudBackend>, chunk_size: usize) -> Self {
        BatchUploader {
            cloud,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Uploads `records` chunk by chunk. Records that fail to serialize are
    /// rejected and left out of the chunks.
    pub async fn upload<T: SyncableRecord>(&self, records: &[T]) -> SyncResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut ids = Vec::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());

        for record in records {
            match to_cloud_row(record) {
                Ok(row) => {
                    ids.push(record.local_id().to_string());
                    rows.push(row);
                }
                Err(e) => {
                    warn!(entity = %T::KIND, local_id = %record.local_id(), error = %e, "Record rejected");
                    report.rejected.push(RecordRejection {
                        local_id: record.local_id().to_string(),
                        error: e.into(),
                    });
                }
            }
        }

        let table = T::KIND.table();
        let chunks = ids.chunks(self.chunk_size).zip(rows.chunks(self.chunk_size));
        let mut aborted = false;

        for (index, (chunk_ids, chunk_rows)) in chunks.enumerate() {
            let ids = chunk_ids.iter().cloned();

            if aborted {
                report.not_attempted.extend(ids);
                continue;
            }

            match self.cloud.upsert(table, chunk_rows).await {
                Ok(()) => {
                    debug!(entity = %T::KIND, chunk = index, count = chunk_ids.len(), "Chunk committed");
                    report.committed.extend(ids);
                }
                Err(error) => {
                    warn!(entity = %T::KIND, chunk = index, %error, "Chunk failed");
                    aborted = matches!(
                        error,
                        SyncError::NotAuthenticated(_) | SyncError::ShuttingDown
                    );
                    report.failed.push(ChunkFailure {
                        index,
                        local_ids: ids.collect(),
                        error,
                    });
                }
            }
        }

        Ok(report)
    }
}
