//! # Cloud Session Context
//!
//! Holds the signed-in Cloud session and resolves the tenant every remote
//! read and write is scoped to.
//!
//! ## Tenant Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  cloud.tenant_id set?  ──yes──► use it                                  │
//! │        │                                                                │
//! │        no                                                               │
//! │        ▼                                                                │
//! │  session JWT present?  ──yes──► claim shop_id                           │
//! │        │                        else claim tenant_id                    │
//! │        │                        else app_metadata.shop_id               │
//! │        no                                                               │
//! │        ▼                                                                │
//! │  NotAuthenticated  (the domain's cycle aborts, nothing is retried      │
//! │                     until a session is set)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The JWT is only *read* here. The Cloud backend verifies it on every
//! request; a stale or forged token comes back as 401.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::CloudSettings;
use crate::error::{SyncError, SyncResult};

/// Claims we read from the Cloud session token.
#[derive(Debug, Default, Deserialize)]
struct SessionClaims {
    #[serde(default)]
    shop_id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    app_metadata: Option<serde_json::Value>,
    #[serde(default)]
    exp: Option<i64>,
}

impl SessionClaims {
    fn tenant(&self) -> Option<String> {
        self.shop_id
            .clone()
            .or_else(|| self.tenant_id.clone())
            .or_else(|| {
                self.app_metadata
                    .as_ref()
                    .and_then(|meta| meta.get("shop_id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .filter(|t| !t.trim().is_empty())
    }
}

/// An active Cloud session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token for Cloud requests.
    pub access_token: String,
    /// Tenant carried by the token, if any.
    pub tenant_id: Option<String>,
    /// Token expiry, if the token states one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Reads a session JWT without verifying its signature.
    pub fn from_token(token: impl Into<String>) -> SyncResult<Self> {
        let access_token = token.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = decode::<SessionClaims>(&access_token, &DecodingKey::from_secret(&[]), &validation)?;
        let claims = data.claims;

        Ok(Session {
            tenant_id: claims.tenant(),
            expires_at: claims
                .exp
                .and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
            access_token,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared, swappable session state.
///
/// Cloned into every client that needs the bearer token or tenant.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Tenant pinned by configuration; wins over token claims.
    configured_tenant: Option<String>,
    session: Arc<RwLock<Option<Session>>>,
}

impl SessionContext {
    /// Builds the context from `[cloud]` settings.
    ///
    /// An unreadable configured token is an error; a missing one is not.
    pub fn from_settings(settings: &CloudSettings) -> SyncResult<Self> {
        let session = settings
            .session_token
            .as_deref()
            .map(Session::from_token)
            .transpose()?;

        Ok(SessionContext {
            configured_tenant: settings
                .tenant_id
                .clone()
                .filter(|t| !t.trim().is_empty()),
            session: Arc::new(RwLock::new(session)),
        })
    }

    /// A context pinned to `tenant_id` with no bearer token.
    pub fn with_tenant(tenant_id: impl Into<String>) -> Self {
        SessionContext {
            configured_tenant: Some(tenant_id.into()),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Installs a new session token (sign-in or external refresh).
    pub async fn set_token(&self, token: impl Into<String>) -> SyncResult<()> {
        let session = Session::from_token(token)?;
        info!(tenant_id = ?session.tenant_id, "Cloud session updated");
        *self.session.write().await = Some(session);
        Ok(())
    }

    /// Drops the session (sign-out).
    pub async fn clear(&self) {
        *self.session.write().await = None;
        info!("Cloud session cleared");
    }

    /// Resolves the tenant for remote calls.
    pub async fn tenant_id(&self) -> SyncResult<String> {
        if let Some(ref tenant) = self.configured_tenant {
            return Ok(tenant.clone());
        }

        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) => session.tenant_id.clone().ok_or_else(|| {
                SyncError::NotAuthenticated("session token carries no shop id".into())
            }),
            None => Err(SyncError::NotAuthenticated(
                "no tenant configured and no session".into(),
            )),
        }
    }

    /// Current bearer token, if signed in.
    pub async fn bearer(&self) -> Option<String> {
        let guard = self.session.read().await;
        let token = guard.as_ref().map(|s| s.access_token.clone());
        if token.is_none() {
            debug!("No Cloud session token; using API key only");
        }
        token
    }

    /// Whether a tenant can be resolved right now.
    pub async fn is_authenticated(&self) -> bool {
        self.tenant_id().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"cloud-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_reads_shop_id_claim() {
        let session = Session::from_token(token(json!({
            "sub": "user-1",
            "aud": "authenticated",
            "shop_id": "shop-7",
            "exp": 4_102_444_800i64
        })))
        .unwrap();

        assert_eq!(session.tenant_id.as_deref(), Some("shop-7"));
        assert!(!session.is_expired(Utc::now()));
    }

    #[test]
    fn test_falls_back_to_app_metadata() {
        let session = Session::from_token(token(json!({
            "sub": "user-1",
            "app_metadata": { "shop_id": "shop-9" }
        })))
        .unwrap();
        assert_eq!(session.tenant_id.as_deref(), Some("shop-9"));
        assert!(session.expires_at.is_none());
    }

    #[test]
    fn test_garbage_token_is_not_authenticated() {
        let err = Session::from_token("not-a-jwt").unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn test_configured_tenant_wins() {
        let settings = CloudSettings {
            tenant_id: Some("pinned".into()),
            session_token: Some(token(json!({ "shop_id": "from-token" }))),
            ..CloudSettings::default()
        };
        let ctx = SessionContext::from_settings(&settings).unwrap();
        assert_eq!(ctx.tenant_id().await.unwrap(), "pinned");
        assert!(ctx.bearer().await.is_some());
    }

    #[tokio::test]
    async fn test_no_context_is_not_authenticated() {
        let ctx = SessionContext::default();
        assert!(matches!(
            ctx.tenant_id().await,
            Err(SyncError::NotAuthenticated(_))
        ));

        ctx.set_token(token(json!({ "tenant_id": "shop-3" })))
            .await
            .unwrap();
        assert_eq!(ctx.tenant_id().await.unwrap(), "shop-3");

        ctx.clear().await;
        assert!(!ctx.is_authenticated().await);
    }
}
