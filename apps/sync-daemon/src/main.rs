//! # tally-syncd
//!
//! Runs the sync engine as a long-lived background process.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         tally-syncd startup                             │
//! │                                                                         │
//! │  1. tracing           RUST_LOG or "info,tally_sync=debug,sqlx=warn"     │
//! │  2. SyncConfig        sync.toml + TALLY_* environment                   │
//! │  3. Database          open tally.db, run migrations                     │
//! │  4. Clients           CloudHttpClient (+ PosHttpClient if configured)   │
//! │  5. Orchestrator      five EntitySyncers sharing one write lane         │
//! │  6. Background tasks                                                    │
//! │       Scheduler ──────────► sync_now() every poll_interval              │
//! │       ReachabilityMonitor ► ReachabilitySignal (optional)               │
//! │       WebhookServer ──────► WebhookWorker (optional)                    │
//! │  7. Wait for Ctrl+C / SIGTERM, then stop in reverse order               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally_db::Database;
use tally_sync::{
    CloudBackend, CloudHttpClient, LogEmitter, PosHttpClient, ReachabilityMonitor,
    ReachabilitySignal, Scheduler, SessionContext, SyncConfig, SyncContext, SyncOrchestrator,
    WebhookIngestor, WebhookServer, WebhookVerifier, WebhookWorker,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to sync.toml. Defaults to the platform config directory.
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single sync cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("Starting tally-syncd...");

    let config = SyncConfig::load(cli.config).context("failed to load sync config")?;
    if !config.is_cloud_configured() {
        bail!("cloud.url is not set (config file or TALLY_CLOUD_URL)");
    }

    // Local store
    let db_path = config.database_path()?;
    let db = Database::open_file(&db_path)
        .await
        .with_context(|| format!("failed to open local store at {}", db_path.display()))?;
    info!(path = %db_path.display(), "Local store ready");

    // Collaborators
    let session = SessionContext::from_settings(&config.cloud)?;
    let cloud: Arc<dyn CloudBackend> = Arc::new(CloudHttpClient::new(
        &config.cloud,
        session.clone(),
        config.request_timeout(),
    )?);

    let mut ctx = SyncContext::new(db.clone(), cloud.clone(), session, &config.sync)
        .with_emitter(Arc::new(LogEmitter));
    if config.is_pos_configured() {
        let pos = PosHttpClient::new(&config.pos, config.request_timeout())?;
        ctx = ctx.with_pos(Arc::new(pos));
        info!("POS platform configured");
    } else {
        info!("No POS platform configured, Cloud-only sync");
    }

    let signal = ReachabilitySignal::default();
    let orchestrator = Arc::new(
        SyncOrchestrator::new(ctx, config.pos_poll_interval()).with_reachability(signal.clone()),
    );
    orchestrator.refresh_counts().await;

    if cli.once {
        let outcome = orchestrator.sync_now().await;
        info!(?outcome, "Single cycle finished");
        db.close().await;
        return Ok(());
    }

    // Background tasks
    let (scheduler, scheduler_handle) = Scheduler::new(
        orchestrator.clone(),
        config.poll_interval(),
        config.sync.auto_sync,
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let monitor = config.reachability_interval().map(|interval| {
        let (monitor, handle) = ReachabilityMonitor::new(cloud.clone(), signal.clone(), interval);
        (tokio::spawn(monitor.run()), handle)
    });

    let webhook = if config.webhook.enabled {
        let verifier = WebhookVerifier::from_settings(&config.pos)?;
        let (ingestor, jobs) = WebhookIngestor::channel(verifier, config.webhook.queue_capacity);
        let worker = WebhookWorker::new(
            orchestrator.clone(),
            jobs,
            config.webhook.import_unknown_objects,
        );
        let worker_task = tokio::spawn(worker.run());
        let server = WebhookServer::new(config.webhook.clone(), ingestor)
            .start()
            .await?;
        info!(addr = %server.local_addr(), path = %config.webhook.path, "Webhook listener started");
        Some((server, worker_task))
    } else {
        None
    };

    shutdown_signal().await?;

    // Stop intake first so the worker can drain.
    if let Some((server, worker_task)) = webhook {
        if let Err(e) = server.shutdown().await {
            warn!(error = %e, "Webhook listener already stopped");
        }
        if let Err(e) = worker_task.await {
            warn!(error = %e, "Webhook worker panicked");
        }
    }
    if let Some((task, handle)) = monitor {
        if let Err(e) = handle.shutdown().await {
            warn!(error = %e, "Reachability monitor already stopped");
        }
        let _ = task.await;
    }
    if let Err(e) = scheduler_handle.shutdown().await {
        warn!(error = %e, "Scheduler already stopped");
    }
    let _ = scheduler_task.await;

    db.close().await;
    info!("tally-syncd stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_sync=trace` - Trace the engine only
/// - Default: INFO, DEBUG for the engine
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally_sync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("Shutdown signal received, stopping...");
    Ok(())
}
