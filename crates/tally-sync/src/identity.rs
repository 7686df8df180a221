//! # Identity Resolver
//!
//! Maps an incoming remote record to zero or one local record.
//!
//! ```text
//! incoming ──► local_id?      ──hit──► Existing (LocalId)
//!                 │ miss (or absent: POS objects have none)
//!                 ▼
//!              external_ref?  ──hit──► Existing (ExternalRef)
//!                 │ miss
//!                 ▼
//!              match keys     ──hit──► Existing (MatchKey)
//!              (email, phone,          └─ external_ref backfilled (if the
//!               sku)                      incoming record has one), saved
//!                 │ miss                  as pending
//!                 ▼
//!              New
//! ```
//!
//! Match keys are consulted whether or not the incoming record carries an
//! `external_ref`: a Cloud row created on another device for the same
//! customer has neither our id nor a POS id. Only local records not yet
//! linked to a POS object are candidates.
//!
//! The backfill means the next event for the same POS object takes the
//! `external_ref` path instead of matching on a key that may have changed.
//! The record goes back to `pending` so the Cloud row learns the link.

use tracing::debug;

use tally_core::SyncableRecord;
use tally_db::RecordRepository;

use crate::error::SyncResult;

/// How an existing record was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    LocalId,
    ExternalRef,
    MatchKey,
}

/// Result of [`IdentityResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Existing { record: T, matched_by: MatchedBy },
    New,
}

/// Stateless lookup over the record repository.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    records: RecordRepository,
}

impl IdentityResolver {
    pub fn new(records: RecordRepository) -> Self {
        IdentityResolver { records }
    }

    /// Finds the local counterpart of `incoming`.
    ///
    /// `incoming.local_id()` is only consulted when `trust_local_id` is set:
    /// Cloud rows carry our ids, POS objects arrive with a freshly minted
    /// one that means nothing yet.
    pub async fn resolve<T: SyncableRecord>(
        &self,
        incoming: &T,
        trust_local_id: bool,
    ) -> SyncResult<Resolution<T>> {
        if trust_local_id && !incoming.local_id().is_empty() {
            if let Some(record) = self.records.get::<T>(incoming.local_id()).await? {
                return Ok(Resolution::Existing {
                    record,
                    matched_by: MatchedBy::LocalId,
                });
            }
        }

        let external_ref = incoming.external_ref();

        if let Some(external_ref) = external_ref {
            if let Some(record) = self.records.find_by_external_ref::<T>(external_ref).await? {
                return Ok(Resolution::Existing {
                    record,
                    matched_by: MatchedBy::ExternalRef,
                });
            }
        }

        for key in incoming.match_keys() {
            let Some(mut record) = self.records.find_by_match_key::<T>(&key).await? else {
                continue;
            };
            debug!(
                entity = %T::KIND,
                local_id = %record.local_id(),
                external_ref,
                key = key.kind.as_str(),
                "Matched by secondary key"
            );

            if let Some(external_ref) = external_ref {
                let meta = record.meta_mut();
                meta.external_ref = Some(external_ref.to_string());
                meta.reset_for_retry();
                self.records.save(&record).await?;
            }

            return Ok(Resolution::Existing {
                record,
                matched_by: MatchedBy::MatchKey,
            });
        }

        Ok(Resolution::New)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
