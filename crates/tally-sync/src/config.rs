//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_TENANT_ID=shop-42                                            │
//! │     TALLY_CONFLICT_STRATEGY=server_wins                                │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.tally.tally/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     newest_wins, 30 s poll, auto-sync on, batches of 100               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [cloud]
//! url = "https://api.tally.example/rest/v1"
//! api_key = "anon-key"
//! session_token = "eyJhbGciOi..."   # tenant is read from its shop_id claim
//!
//! [pos]
//! base_url = "https://connect.pos.example/v2"
//! access_token = "..."
//! refresh_token = "..."
//! webhook_signature_key = "..."
//! webhook_notification_url = "https://shop.example/webhook"
//!
//! [sync]
//! conflict_strategy = "newest_wins"  # server_wins | local_wins | newest_wins
//! poll_interval_secs = 30
//! auto_sync = true
//!
//! [webhook]
//! enabled = true
//! port = 8787
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use tally_core::{ConflictStrategy, RetryPolicy, DELAY_CEILING_SECS};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Cloud Settings
// =============================================================================

/// Connection to the Cloud backend (PostgREST-style REST API).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudSettings {
    /// REST base URL, e.g. `https://<project>.example/rest/v1`.
    #[serde(default)]
    pub url: Option<String>,

    /// Project API key sent as `apikey`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Signed-in session JWT sent as the bearer token.
    #[serde(default)]
    pub session_token: Option<String>,

    /// Explicit tenant ("shop id"). Falls back to the session token claims.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

// =============================================================================
// POS Settings
// =============================================================================

/// Connection to the POS platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosSettings {
    /// REST base URL. POS import and webhooks are off when unset.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Shared secret for webhook HMAC signatures.
    #[serde(default)]
    pub webhook_signature_key: Option<String>,

    /// The exact URL registered with the POS; part of the signed message.
    #[serde(default)]
    pub webhook_notification_url: Option<String>,

    /// Objects per list page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Interval between full POS imports (seconds). Webhooks cover the gap.
    #[serde(default = "default_pos_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_page_size() -> u32 {
    100
}

fn default_pos_poll_interval() -> u64 {
    300
}

impl Default for PosSettings {
    fn default() -> Self {
        PosSettings {
            base_url: None,
            access_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            webhook_signature_key: None,
            webhook_notification_url: None,
            page_size: default_page_size(),
            poll_interval_secs: default_pos_poll_interval(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Global conflict strategy for every merge path.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Interval between scheduled cycles (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Run scheduled cycles. Manual `sync_now` works either way.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Rows per Cloud upsert call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Record-level failures before a record is parked as `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (seconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Retry delay ceiling (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Per-request timeout for Cloud and POS calls (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Reachability monitor interval (seconds). 0 disables the monitor.
    #[serde(default = "default_reachability_interval")]
    pub reachability_interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    tally_core::DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    tally_core::DEFAULT_BATCH_SIZE
}
fn default_max_attempts() -> u32 {
    tally_core::retry::DEFAULT_MAX_ATTEMPTS
}
fn default_initial_backoff() -> u64 {
    tally_core::retry::DEFAULT_INITIAL_DELAY_SECS
}
fn default_max_backoff() -> u64 {
    tally_core::retry::DEFAULT_MAX_DELAY_SECS
}
fn default_request_timeout() -> u64 {
    30
}
fn default_reachability_interval() -> u64 {
    15
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            conflict_strategy: ConflictStrategy::default(),
            poll_interval_secs: default_poll_interval(),
            auto_sync: true,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            reachability_interval_secs: default_reachability_interval(),
        }
    }
}

// =============================================================================
// Webhook Settings
// =============================================================================

/// Webhook listener settings.
///
/// ```text
/// POS ──POST /webhook──► listener ──► bounded queue ──► worker
///                          │                              │
///                     200 / 400 / 401              targeted re-sync
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,

    #[serde(default = "default_webhook_path")]
    pub path: String,

    /// Import POS objects we have never mirrored when a webhook names them.
    #[serde(default = "default_true")]
    pub import_unknown_objects: bool,

    /// Accepted events waiting for the worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_webhook_port() -> u16 {
    8787
}
fn default_webhook_path() -> String {
    "/webhook".to_string()
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for WebhookSettings {
    fn default() -> Self {
        WebhookSettings {
            enabled: false,
            bind_addr: default_bind_addr(),
            port: default_webhook_port(),
            path: default_webhook_path(),
            import_unknown_objects: true,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WebhookSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Local store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite file. Defaults to `tally.db` in the project data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub pos: PosSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref url) = self.cloud.url {
            validate_http_url("cloud.url", url)?;
        }
        if let Some(ref url) = self.pos.base_url {
            validate_http_url("pos.base_url", url)?;
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }
        if self.sync.initial_backoff_secs > self.sync.max_backoff_secs {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_secs must not exceed max_backoff_secs".into(),
            ));
        }
        if self.sync.max_backoff_secs > DELAY_CEILING_SECS {
            return Err(SyncError::InvalidConfig(format!(
                "max_backoff_secs must be at most {DELAY_CEILING_SECS}"
            )));
        }
        if self.pos.page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "pos.page_size must be greater than 0".into(),
            ));
        }

        if self.webhook.enabled {
            if self.pos.webhook_signature_key.is_none() {
                return Err(SyncError::InvalidConfig(
                    "webhook.enabled requires pos.webhook_signature_key".into(),
                ));
            }
            if self.pos.webhook_notification_url.is_none() {
                return Err(SyncError::InvalidConfig(
                    "webhook.enabled requires pos.webhook_notification_url".into(),
                ));
            }
            if !self.webhook.path.starts_with('/') {
                return Err(SyncError::InvalidConfig(format!(
                    "webhook.path must start with '/', got: {}",
                    self.webhook.path
                )));
            }
            if self.webhook.queue_capacity == 0 {
                return Err(SyncError::InvalidConfig(
                    "webhook.queue_capacity must be greater than 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup (the environment in production).
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Cloud
        if let Some(url) = var("TALLY_CLOUD_URL") {
            debug!(url = %url, "Overriding Cloud URL from environment");
            self.cloud.url = Some(url);
        }
        if let Some(key) = var("TALLY_CLOUD_API_KEY") {
            self.cloud.api_key = Some(key);
        }
        if let Some(token) = var("TALLY_SESSION_TOKEN") {
            self.cloud.session_token = Some(token);
        }
        if let Some(tenant) = var("TALLY_TENANT_ID") {
            debug!(tenant_id = %tenant, "Overriding tenant from environment");
            self.cloud.tenant_id = Some(tenant);
        }

        // POS
        if let Some(url) = var("TALLY_POS_BASE_URL") {
            self.pos.base_url = Some(url);
        }
        if let Some(token) = var("TALLY_POS_ACCESS_TOKEN") {
            self.pos.access_token = Some(token);
        }
        if let Some(token) = var("TALLY_POS_REFRESH_TOKEN") {
            self.pos.refresh_token = Some(token);
        }
        if let Some(id) = var("TALLY_POS_CLIENT_ID") {
            self.pos.client_id = Some(id);
        }
        if let Some(secret) = var("TALLY_POS_CLIENT_SECRET") {
            self.pos.client_secret = Some(secret);
        }
        if let Some(key) = var("TALLY_WEBHOOK_SIGNATURE_KEY") {
            self.pos.webhook_signature_key = Some(key);
        }
        if let Some(url) = var("TALLY_WEBHOOK_NOTIFICATION_URL") {
            self.pos.webhook_notification_url = Some(url);
        }

        // Sync behavior
        if let Some(strategy) = var("TALLY_CONFLICT_STRATEGY") {
            match strategy.parse() {
                Ok(parsed) => {
                    debug!(strategy = %strategy, "Overriding conflict strategy from environment");
                    self.sync.conflict_strategy = parsed;
                }
                Err(_) => warn!(strategy = %strategy, "Unknown conflict strategy in environment"),
            }
        }
        if let Some(secs) = var("TALLY_POLL_INTERVAL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.sync.poll_interval_secs = s;
            }
        }
        if let Some(auto) = var("TALLY_AUTO_SYNC") {
            match auto.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.sync.auto_sync = true,
                "0" | "false" | "no" | "off" => self.sync.auto_sync = false,
                _ => warn!(value = %auto, "Unknown TALLY_AUTO_SYNC value in environment"),
            }
        }

        // Webhook listener
        if let Some(port) = var("TALLY_WEBHOOK_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding webhook port from environment");
                self.webhook.port = p;
            }
        }

        // Store
        if let Some(path) = var("TALLY_DB_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// SQLite file for the local store.
    pub fn database_path(&self) -> SyncResult<PathBuf> {
        if let Some(ref path) = self.store.path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .ok_or_else(|| SyncError::InvalidConfig("no data directory for the local store".into()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts,
            initial_delay_secs: self.sync.initial_backoff_secs,
            max_delay_secs: self.sync.max_backoff_secs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn pos_poll_interval(&self) -> Duration {
        Duration::from_secs(self.pos.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    /// `None` when the monitor is disabled.
    pub fn reachability_interval(&self) -> Option<Duration> {
        (self.sync.reachability_interval_secs > 0)
            .then(|| Duration::from_secs(self.sync.reachability_interval_secs))
    }

    pub fn is_cloud_configured(&self) -> bool {
        self.cloud.url.is_some()
    }

    pub fn is_pos_configured(&self) -> bool {
        self.pos.base_url.is_some()
    }
}

fn validate_http_url(field: &str, raw: &str) -> SyncResult<()> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{field}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SyncError::InvalidUrl(format!(
            "{field} must start with http:// or https://, got: {raw}"
        )));
    }
    Ok(())
}
