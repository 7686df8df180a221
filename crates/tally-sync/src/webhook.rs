//! # Webhook Ingestor
//!
//! Fast path for POS push notifications: verify, decode, route, queue.
//! A single worker drains the queue and performs targeted re-syncs through
//! the orchestrator, so webhook traffic never writes to the store directly.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  POST /webhook ──► WebhookServer (Axum)                                 │
//! │                        │                                                │
//! │                        ▼                                                │
//! │               WebhookIngestor::handle(body, signature)                  │
//! │                 1. HMAC-SHA256 check ──fail──► 401 InvalidSignature     │
//! │                 2. decode envelope   ──fail──► 400 InvalidPayload       │
//! │                 3. route by type     ──none──► 200, dropped + logged    │
//! │                 4. try_send job      ──full──► 503, POS redelivers      │
//! │                        │                                                │
//! │                        ▼ bounded mpsc                                   │
//! │               WebhookWorker (single consumer)                           │
//! │                        │                                                │
//! │                        ▼                                                │
//! │               SyncOrchestrator::resync_pos_object(kind, id)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once and unordered relative to the scheduled
//! download. Correctness rests on the idempotent merge, not on excluding
//! one trigger while the other runs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tally_core::EntityKind;

use crate::config::{PosSettings, WebhookSettings};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 signature.
pub const SIGNATURE_HEADER: &str = "x-pos-hmacsha256-signature";

// =============================================================================
// Signature Verification
// =============================================================================

/// Checks webhook signatures against the shared secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
    notification_url: String,
}

impl WebhookVerifier {
    pub fn new(key: impl Into<Vec<u8>>, notification_url: impl Into<String>) -> Self {
        WebhookVerifier {
            key: key.into(),
            notification_url: notification_url.into(),
        }
    }

    /// Builds a verifier from `[pos]` settings. Both the signature key and
    /// the notification URL are required.
    pub fn from_settings(settings: &PosSettings) -> SyncResult<Self> {
        let key = settings
            .webhook_signature_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                SyncError::InvalidConfig("webhooks need pos.webhook_signature_key".into())
            })?;
        let url = settings
            .webhook_notification_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                SyncError::InvalidConfig("webhooks need pos.webhook_notification_url".into())
            })?;
        Ok(WebhookVerifier::new(key.as_bytes(), url))
    }

    fn mac(&self, body: &[u8]) -> SyncResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SyncError::Internal(format!("webhook key: {e}")))?;
        mac.update(self.notification_url.as_bytes());
        mac.update(body);
        Ok(mac)
    }

    /// Signature the POS would send for `body`.
    pub fn sign(&self, body: &[u8]) -> SyncResult<String> {
        Ok(BASE64.encode(self.mac(body)?.finalize().into_bytes()))
    }

    /// Verifies `signature` in constant time. Fails closed.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> SyncResult<()> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SyncError::InvalidSignature)?;
        let expected = BASE64
            .decode(signature)
            .map_err(|_| SyncError::InvalidSignature)?;

        self.mac(body)?
            .verify_slice(&expected)
            .map_err(|_| SyncError::InvalidSignature)
    }
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<EnvelopeData>,
    #[serde(default, alias = "objectId")]
    object_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    id: Option<String>,
}

impl Envelope {
    fn object_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.id.as_deref())
            .or(self.object_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Maps an event type to the domain it concerns.
pub fn route_event(event_type: &str) -> Option<EntityKind> {
    let family = event_type.split('.').next().unwrap_or_default();
    match family {
        "inventory" | "catalog" => Some(EntityKind::InventoryItem),
        "customer" => Some(EntityKind::Customer),
        _ => None,
    }
}

// =============================================================================
// Ingestor
// =============================================================================

/// A verified, routed webhook waiting for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookJob {
    pub kind: EntityKind,
    pub object_id: String,
    pub event_type: String,
}

/// What `handle` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued(WebhookJob),
    /// Verified but not a type we sync.
    Dropped { event_type: String },
}

/// Verifies and queues webhook deliveries.
pub struct WebhookIngestor {
    verifier: WebhookVerifier,
    jobs: mpsc::Sender<WebhookJob>,
}

impl WebhookIngestor {
    /// Creates the ingestor and the receiving end of its job queue.
    pub fn channel(
        verifier: WebhookVerifier,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WebhookJob>) {
        let (jobs, rx) = mpsc::channel(capacity.max(1));
        (WebhookIngestor { verifier, jobs }, rx)
    }

    /// Handles one delivery. The payload is never looked at before the
    /// signature checks out.
    pub fn handle(&self, raw_body: &[u8], signature: Option<&str>) -> SyncResult<IngestOutcome> {
        self.verifier.verify(raw_body, signature)?;

        let envelope: Envelope = serde_json::from_slice(raw_body)
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        let Some(kind) = route_event(&envelope.event_type) else {
            info!(event_type = %envelope.event_type, "Ignoring unrecognized webhook event");
            return Ok(IngestOutcome::Dropped {
                event_type: envelope.event_type,
            });
        };

        let object_id = envelope
            .object_id()
            .ok_or_else(|| SyncError::InvalidPayload("event carries no object id".into()))?
            .to_string();

        let job = WebhookJob {
            kind,
            object_id,
            event_type: envelope.event_type,
        };
        self.jobs.try_send(job.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::ChannelError("webhook queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => SyncError::ShuttingDown,
        })?;

        debug!(entity = %job.kind, object_id = %job.object_id, "Webhook queued");
        Ok(IngestOutcome::Queued(job))
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Single consumer of the webhook queue.
pub struct WebhookWorker {
    orchestrator: Arc<SyncOrchestrator>,
    jobs: mpsc::Receiver<WebhookJob>,
    import_unknown: bool,
}

impl WebhookWorker {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        jobs: mpsc::Receiver<WebhookJob>,
        import_unknown: bool,
    ) -> Self {
        WebhookWorker {
            orchestrator,
            jobs,
            import_unknown,
        }
    }

    /// Drains the queue until every sender is gone.
    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            self.process(&job).await;
        }
        debug!("Webhook worker stopped");
    }

    async fn process(&self, job: &WebhookJob) {
        match self
            .orchestrator
            .resync_pos_object(job.kind, &job.object_id, self.import_unknown)
            .await
        {
            Ok(outcome) => debug!(
                entity = %job.kind,
                object_id = %job.object_id,
                ?outcome,
                "Webhook re-sync done"
            ),
            // The next scheduled import picks the object up.
            Err(e) => warn!(
                entity = %job.kind,
                object_id = %job.object_id,
                error = %e,
                "Webhook re-sync failed"
            ),
        }
    }
}

// =============================================================================
// HTTP Listener
// =============================================================================

/// Axum server exposing the webhook endpoint.
pub struct WebhookServer {
    settings: WebhookSettings,
    ingestor: Arc<WebhookIngestor>,
}

/// Handle for controlling the webhook server.
#[derive(Clone)]
pub struct WebhookServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl WebhookServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting requests. Dropping the server also drops the
    /// ingestor, which lets the worker drain and exit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Webhook shutdown channel closed".into()))
    }
}

impl WebhookServer {
    pub fn new(settings: WebhookSettings, ingestor: WebhookIngestor) -> Self {
        WebhookServer {
            settings,
            ingestor: Arc::new(ingestor),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.settings.path, post(webhook_handler))
            .route("/health", get(health_handler))
            .with_state(self.ingestor.clone())
    }

    /// Binds and serves in the background.
    pub async fn start(self) -> SyncResult<WebhookServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = self.router();

        let bind_addr = self.settings.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::Network(format!("Failed to bind webhook listener to {bind_addr}: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Network(format!("Webhook listener address: {e}")))?;

        info!(addr = %local_addr, path = %self.settings.path, "Webhook listener started");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Webhook listener shutting down");
                })
                .await
                .ok();
        });

        Ok(WebhookServerHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn webhook_handler(
    State(ingestor): State<Arc<WebhookIngestor>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match ingestor.handle(&body, signature) {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Webhook rejected");
            status_for(&e)
        }
    }
}

fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::InvalidSignature => StatusCode::UNAUTHORIZED,
        SyncError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        SyncError::ChannelError(_) | SyncError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
