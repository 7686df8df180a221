//! # Cloud Backend Client
//!
//! Tenant-scoped upsert and filtered select against the Cloud backend's
//! PostgREST-style REST API.
//!
//! ## Requests
//! ```text
//! upsert   POST /{table}?on_conflict=tenant_id,local_id
//!          Prefer: resolution=merge-duplicates,return=minimal
//!          body: [row, row, ...]
//!
//! select   GET  /{table}?tenant_id=eq.{tenant}
//!                       &deleted_at=is.null                (live rows)
//!                       &deleted_at=not.is.null
//!                       &synced_at=gte.{since}             (tombstones)
//!                       &order=updated_at.asc,local_id.asc
//!                       &limit={page}&offset={n}
//!
//! ping     GET  /      any status below 500 counts as reachable
//! ```
//!
//! Every request carries `apikey` and a bearer token (the session token
//! when signed in, the API key otherwise).
//!
//! ## Server Write Stamp
//! `synced_at` is set by the backend (a `now()` trigger) on every insert and
//! update. It is the only column the tombstone cursor may follow: a device
//! that deleted a record offline uploads an old `deleted_at` long after
//! newer tombstones were pulled. Backends that do not expose `synced_at`
//! return rows without it, the cursor never advances, and every download
//! pulls all tombstones.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::config::CloudSettings;
use crate::error::{SyncError, SyncResult};
use crate::session::SessionContext;

/// Column the backend stamps on every write.
pub const SYNCED_AT: &str = "synced_at";

/// Rows fetched per select page.
const SELECT_PAGE_SIZE: usize = 1000;

/// Longest error body kept in an `Api` error message.
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Filters
// =============================================================================

/// Which rows a select returns with respect to tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion {
    /// `deleted_at IS NULL`
    Live,
    /// `deleted_at IS NOT NULL`, optionally only rows the backend wrote at
    /// or after a cursor.
    Tombstones { synced_since: Option<DateTime<Utc>> },
}

/// Filter for [`CloudBackend::select`]. Always scoped to one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudFilter {
    pub deletion: Deletion,
    /// Restricts the select to a single record.
    pub local_id: Option<String>,
}

impl CloudFilter {
    pub fn live() -> Self {
        CloudFilter {
            deletion: Deletion::Live,
            local_id: None,
        }
    }

    pub fn tombstones_since(synced_since: Option<DateTime<Utc>>) -> Self {
        CloudFilter {
            deletion: Deletion::Tombstones { synced_since },
            local_id: None,
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// The Cloud collaborator as seen by the syncers.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Inserts or updates `rows` keyed by `(tenant_id, local_id)`.
    ///
    /// One call is one remote statement; a failure means none of `rows`
    /// were written.
    async fn upsert(&self, table: &str, rows: &[Value]) -> SyncResult<()>;

    /// Fetches every row of `table` for `tenant_id` matching `filter`,
    /// oldest change first.
    async fn select(
        &self,
        table: &str,
        tenant_id: &str,
        filter: &CloudFilter,
    ) -> SyncResult<Vec<Value>>;

    /// Cheap reachability check.
    async fn ping(&self) -> SyncResult<()>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// [`CloudBackend`] over HTTPS.
#[derive(Debug, Clone)]
pub struct CloudHttpClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    session: SessionContext,
}

impl CloudHttpClient {
    /// Builds a client for the configured Cloud project.
    pub fn new(
        settings: &CloudSettings,
        session: SessionContext,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let raw = settings
            .url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("cloud.url is not set".into()))?;

        // A trailing slash makes Url::join append rather than replace.
        let base_url = Url::parse(&format!("{}/", raw.trim_end_matches('/')))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(CloudHttpClient {
            client,
            base_url,
            api_key: settings.api_key.clone(),
            session,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    fn table_url(&self, table: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(table)?)
    }

    fn upsert_url(&self, table: &str) -> SyncResult<Url> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("on_conflict", "tenant_id,local_id");
        Ok(url)
    }

    fn select_url(
        &self,
        table: &str,
        tenant_id: &str,
        filter: &CloudFilter,
        offset: usize,
    ) -> SyncResult<Url> {
        let mut url = self.table_url(table)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tenant_id", &format!("eq.{tenant_id}"));

            match &filter.deletion {
                Deletion::Live => {
                    query.append_pair("deleted_at", "is.null");
                }
                Deletion::Tombstones { synced_since } => {
                    query.append_pair("deleted_at", "not.is.null");
                    if let Some(since) = synced_since {
                        query.append_pair(
                            SYNCED_AT,
                            &format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
                        );
                    }
                }
            }

            if let Some(ref local_id) = filter.local_id {
                query.append_pair("local_id", &format!("eq.{local_id}"));
            }

            query
                .append_pair("order", "updated_at.asc,local_id.asc")
                .append_pair("limit", &SELECT_PAGE_SIZE.to_string())
                .append_pair("offset", &offset.to_string());
        }
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(ref key) = self.api_key {
            request = request.header("apikey", key);
        }
        match self.session.bearer().await.or_else(|| self.api_key.clone()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turns a non-success response into the error taxonomy.
async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(SyncError::from_status(status.as_u16(), body))
}

#[async_trait]
impl CloudBackend for CloudHttpClient {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(&self, table: &str, rows: &[Value]) -> SyncResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .post(self.upsert_url(table)?)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);

        let response = self.authorize(request).await.send().await?;
        check(response).await?;

        debug!(table, count = rows.len(), "Cloud upsert complete");
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn select(
        &self,
        table: &str,
        tenant_id: &str,
        filter: &CloudFilter,
    ) -> SyncResult<Vec<Value>> {
        let mut rows = Vec::new();
        let mut offset = 0;

        loop {
            let request = self
                .client
                .get(self.select_url(table, tenant_id, filter, offset)?);
            let response = self.authorize(request).await.send().await?;
            let page: Vec<Value> = check(response).await?.json().await?;

            let fetched = page.len();
            rows.extend(page);

            if fetched < SELECT_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        debug!(table, count = rows.len(), "Cloud select complete");
        Ok(rows)
    }

    async fn ping(&self) -> SyncResult<()> {
        let request = self.client.get(self.base_url.clone());
        let response = self.authorize(request).await.send().await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(SyncError::from_status(status.as_u16(), "cloud unavailable"));
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
