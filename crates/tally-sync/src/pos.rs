//! # POS Platform Client
//!
//! Bulk and single-object reads from the POS platform's REST API, plus the
//! mapping from POS objects to local entities.
//!
//! ## OAuth Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  request ──► 200 ─────────────────────────────────────► done            │
//! │     │                                                                   │
//! │     ├──► 401 ──► POST /oauth2/token (refresh_token) ──► retry once      │
//! │     │            (skipped if another task already refreshed)            │
//! │     │                                                                   │
//! │     └──► 408 / 429 / 5xx / transport error                              │
//! │                 ──► exponential backoff, up to MAX_REQUEST_ATTEMPTS     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shapes
//! ```text
//! GET /{collection}?limit=N[&cursor=C]  → { "objects": [...], "cursor": "C2" }
//! GET /{collection}/{id}                → { "object": {...} }   (404 → gone)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use tally_core::{Customer, InventoryItem, SyncMeta, SyncableRecord};

use crate::config::PosSettings;
use crate::error::{SyncError, SyncResult};

/// Attempts per request for retryable failures.
const MAX_REQUEST_ATTEMPTS: u32 = 3;

// =============================================================================
// Collections
// =============================================================================

/// POS object families the engine mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PosCollection {
    Customers,
    Items,
}

impl PosCollection {
    pub fn path(&self) -> &'static str {
        match self {
            PosCollection::Customers => "customers",
            PosCollection::Items => "catalog/items",
        }
    }
}

/// One page of a cursor-paginated list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PosPage {
    #[serde(default)]
    pub objects: Vec<Value>,
    /// Absent on the last page.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEnvelope {
    object: Value,
}

// =============================================================================
// Platform Trait
// =============================================================================

/// The POS collaborator as seen by the syncers.
#[async_trait]
pub trait PosPlatform: Send + Sync {
    /// Fetches one page; pass the previous page's cursor to continue.
    async fn list(&self, collection: PosCollection, cursor: Option<&str>) -> SyncResult<PosPage>;

    /// Fetches one object. `None` when the POS no longer has it.
    async fn fetch(&self, collection: PosCollection, id: &str) -> SyncResult<Option<Value>>;

    async fn ping(&self) -> SyncResult<()>;
}

// =============================================================================
// HTTP Client
// =============================================================================

#[derive(Debug, Clone)]
struct OAuthCredentials {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// [`PosPlatform`] over HTTPS with bearer/refresh-token auth.
#[derive(Debug, Clone)]
pub struct PosHttpClient {
    client: Client,
    base_url: Url,
    page_size: u32,
    credentials: Option<OAuthCredentials>,
    tokens: Arc<RwLock<Tokens>>,
}

impl PosHttpClient {
    pub fn new(settings: &PosSettings, timeout: Duration) -> SyncResult<Self> {
        let raw = settings
            .base_url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("pos.base_url is not set".into()))?;
        let base_url = Url::parse(&format!("{}/", raw.trim_end_matches('/')))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {e}")))?;

        let credentials = match (&settings.client_id, &settings.client_secret) {
            (Some(id), Some(secret)) => Some(OAuthCredentials {
                client_id: id.clone(),
                client_secret: secret.clone(),
            }),
            _ => None,
        };

        Ok(PosHttpClient {
            client,
            base_url,
            page_size: settings.page_size,
            credentials,
            tokens: Arc::new(RwLock::new(Tokens {
                access: settings.access_token.clone(),
                refresh: settings.refresh_token.clone(),
            })),
        })
    }

    fn list_url(&self, collection: PosCollection, cursor: Option<&str>) -> SyncResult<Url> {
        let mut url = self.base_url.join(collection.path())?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        Ok(url)
    }

    fn object_url(&self, collection: PosCollection, id: &str) -> SyncResult<Url> {
        let mut url = self.base_url.join(collection.path())?;
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base_url.to_string()))?
            .push(id);
        Ok(url)
    }

    /// Sends a GET, refreshing the token once on 401 and backing off on
    /// retryable failures. `None` means the POS answered 404.
    async fn get(&self, url: Url) -> SyncResult<Option<Response>> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempt = 1;
        let mut refreshed = false;

        loop {
            let err = match self.send_once(url.clone()).await {
                Ok((response, used_token))
                    if response.status() == StatusCode::UNAUTHORIZED && !refreshed =>
                {
                    refreshed = true;
                    self.refresh(used_token.as_deref()).await?;
                    continue;
                }
                Ok((response, _)) if response.status() == StatusCode::NOT_FOUND => {
                    return Ok(None);
                }
                Ok((response, _)) if response.status().is_success() => {
                    return Ok(Some(response));
                }
                Ok((response, _)) => {
                    SyncError::from_status(response.status().as_u16(), format!("GET {url}"))
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= MAX_REQUEST_ATTEMPTS {
                return Err(err);
            }
            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(%url, attempt, ?delay, error = %err, "POS request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }

    async fn send_once(&self, url: Url) -> SyncResult<(Response, Option<String>)> {
        let token = self.tokens.read().await.access.clone();

        let mut request = self.client.get(url);
        if let Some(ref token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Ok((response, token))
    }

    /// Refreshes the access token unless another task already replaced
    /// `stale_token`.
    async fn refresh(&self, stale_token: Option<&str>) -> SyncResult<()> {
        let mut tokens = self.tokens.write().await;

        if tokens.access.as_deref() != stale_token {
            debug!("POS token already refreshed by another task");
            return Ok(());
        }

        let (creds, refresh_token) = match (&self.credentials, tokens.refresh.clone()) {
            (Some(creds), Some(refresh)) => (creds.clone(), refresh),
            _ => {
                return Err(SyncError::NotAuthenticated(
                    "POS rejected the access token and no refresh credentials are configured"
                        .into(),
                ))
            }
        };

        let body = RefreshRequest {
            client_id: &creds.client_id,
            client_secret: &creds.client_secret,
            grant_type: "refresh_token",
            refresh_token: &refresh_token,
        };
        let response = self
            .client
            .post(self.base_url.join("oauth2/token")?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // A rejected refresh token is an auth failure, not a bad record.
            return Err(SyncError::NotAuthenticated(format!(
                "POS token refresh failed with status {status}"
            )));
        }

        let renewed: TokenResponse = response.json().await?;
        tokens.access = Some(renewed.access_token);
        if let Some(refresh) = renewed.refresh_token {
            tokens.refresh = Some(refresh);
        }

        info!("POS access token refreshed");
        Ok(())
    }

    async fn get_json<D: DeserializeOwned>(&self, url: Url) -> SyncResult<Option<D>> {
        match self.get(url).await? {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PosPlatform for PosHttpClient {
    async fn list(&self, collection: PosCollection, cursor: Option<&str>) -> SyncResult<PosPage> {
        let page: Option<PosPage> = self.get_json(self.list_url(collection, cursor)?).await?;
        let page = page.unwrap_or_default();
        debug!(?collection, count = page.objects.len(), more = page.cursor.is_some(), "POS page fetched");
        Ok(page)
    }

    async fn fetch(&self, collection: PosCollection, id: &str) -> SyncResult<Option<Value>> {
        let envelope: Option<ObjectEnvelope> =
            self.get_json(self.object_url(collection, id)?).await?;
        Ok(envelope.map(|e| e.object))
    }

    async fn ping(&self) -> SyncResult<()> {
        let response = self.client.get(self.base_url.clone()).send().await?;
        if response.status().is_server_error() {
            return Err(SyncError::from_status(response.status().as_u16(), "POS unavailable"));
        }
        Ok(())
    }
}

// =============================================================================
// POS Objects
// =============================================================================

/// A POS customer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosCustomer {
    pub id: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// A POS catalog item with its stock count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosItem {
    pub id: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub name: String,
    #[serde(default)]
    pub price_cents: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Entities that have a POS counterpart.
pub trait FromPos: SyncableRecord {
    const COLLECTION: PosCollection;

    type Dto: DeserializeOwned + Send + Sync;

    fn pos_id(dto: &Self::Dto) -> &str;

    fn pos_updated_at(dto: &Self::Dto) -> Option<DateTime<Utc>>;

    fn pos_is_deleted(dto: &Self::Dto) -> bool;

    /// Builds a new local record. `meta` carries identity and timestamps.
    fn from_pos(dto: &Self::Dto, meta: SyncMeta) -> Self;

    /// Overwrites the POS-owned fields, keeping local-only ones.
    fn apply_pos(&mut self, dto: &Self::Dto);

    /// Decodes a raw POS object.
    fn decode_pos(raw: Value) -> SyncResult<Self::Dto> {
        serde_json::from_value(raw).map_err(|e| {
            SyncError::SerializationFailed(format!("{} from POS: {e}", Self::KIND))
        })
    }
}

impl FromPos for Customer {
    const COLLECTION: PosCollection = PosCollection::Customers;
    type Dto = PosCustomer;

    fn pos_id(dto: &PosCustomer) -> &str {
        &dto.id
    }

    fn pos_updated_at(dto: &PosCustomer) -> Option<DateTime<Utc>> {
        dto.updated_at
    }

    fn pos_is_deleted(dto: &PosCustomer) -> bool {
        dto.is_deleted
    }

    fn from_pos(dto: &PosCustomer, meta: SyncMeta) -> Self {
        let mut customer = Customer {
            meta,
            given_name: String::new(),
            family_name: None,
            email: None,
            phone: None,
            notes: None,
        };
        customer.apply_pos(dto);
        customer
    }

    fn apply_pos(&mut self, dto: &PosCustomer) {
        self.given_name = dto.given_name.clone().unwrap_or_default();
        self.family_name = dto.family_name.clone();
        self.email = dto.email_address.clone();
        self.phone = dto.phone_number.clone();
        if dto.note.is_some() {
            self.notes = dto.note.clone();
        }
    }
}

impl FromPos for InventoryItem {
    const COLLECTION: PosCollection = PosCollection::Items;
    type Dto = PosItem;

    fn pos_id(dto: &PosItem) -> &str {
        &dto.id
    }

    fn pos_updated_at(dto: &PosItem) -> Option<DateTime<Utc>> {
        dto.updated_at
    }

    fn pos_is_deleted(dto: &PosItem) -> bool {
        dto.is_deleted
    }

    fn from_pos(dto: &PosItem, meta: SyncMeta) -> Self {
        let mut item = InventoryItem {
            meta,
            sku: String::new(),
            name: String::new(),
            price_cents: 0,
            cost_cents: None,
            quantity: 0,
            min_quantity: 0,
        };
        item.apply_pos(dto);
        item
    }

    fn apply_pos(&mut self, dto: &PosItem) {
        // Items without a SKU still need a stable match key.
        self.sku = dto.sku.clone().unwrap_or_else(|| dto.id.clone());
        self.name = dto.name.clone();
        if let Some(price) = dto.price_cents {
            self.price_cents = price;
        }
        if let Some(quantity) = dto.quantity {
            self.quantity = quantity;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> PosHttpClient {
        let settings = PosSettings {
            base_url: Some("https://pos.example/v2".into()),
            page_size: 50,
            ..PosSettings::default()
        };
        PosHttpClient::new(&settings, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_list_url_carries_cursor() {
        let url = client()
            .list_url(PosCollection::Items, Some("abc"))
            .unwrap();
        assert_eq!(url.path(), "/v2/catalog/items");
        assert_eq!(url.query(), Some("limit=50&cursor=abc"));
    }

    #[test]
    fn test_object_url_escapes_id() {
        let url = client()
            .object_url(PosCollection::Customers, "a/b")
            .unwrap();
        assert_eq!(url.path(), "/v2/customers/a%2Fb");
    }

    #[test]
    fn test_customer_from_pos() {
        let dto = Customer::decode_pos(json!({
            "id": "C1",
            "given_name": "Ada",
            "email_address": "ADA@example.com",
            "updated_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        let meta = SyncMeta::with_id("l1", "shop", Utc::now());
        let customer = Customer::from_pos(&dto, meta);

        assert_eq!(customer.given_name, "Ada");
        assert_eq!(customer.email.as_deref(), Some("ADA@example.com"));
        assert_eq!(customer.match_keys()[0].value, "ada@example.com");
        assert!(!Customer::pos_is_deleted(&dto));
    }

    #[test]
    fn test_apply_pos_keeps_local_fields() {
        let mut item = InventoryItem::new("shop", "SKU-1", "Screen", 4999);
        item.min_quantity = 3;
        item.cost_cents = Some(2000);

        let dto = PosItem {
            id: "I1".into(),
            sku: Some("SKU-1".into()),
            name: "Screen v2".into(),
            price_cents: Some(5999),
            quantity: Some(2),
            updated_at: None,
            is_deleted: false,
        };
        item.apply_pos(&dto);

        assert_eq!(item.name, "Screen v2");
        assert_eq!(item.price_cents, 5999);
        assert_eq!(item.quantity, 2);
        assert_eq!(item.min_quantity, 3);
        assert_eq!(item.cost_cents, Some(2000));
    }

    #[test]
    fn test_item_without_sku_uses_pos_id() {
        let dto = InventoryItem::decode_pos(json!({ "id": "ITEM9", "name": "Cable" })).unwrap();
        let item = InventoryItem::from_pos(&dto, SyncMeta::with_id("l2", "shop", Utc::now()));
        assert_eq!(item.sku, "ITEM9");
    }

    #[test]
    fn test_undecodable_object_is_serialization_error() {
        let err = InventoryItem::decode_pos(json!({ "id": 5 })).unwrap_err();
        assert!(err.is_record_fatal());
    }
}
