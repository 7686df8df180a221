//! # Scheduler
//!
//! Drives periodic sync cycles and tracks network reachability.
//!
//! ## Tick Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   interval tick                                                         │
//! │        │                                                                │
//! │        ├── auto_sync off ────────► nothing                              │
//! │        ├── reachability down ────► SkippedOffline  (zero network calls) │
//! │        ├── cycle running ────────► SkippedBusy     (not queued)         │
//! │        └── otherwise ────────────► orchestrator.sync_now()              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Skipped ticks are dropped, never queued; the next tick after reachability
//! returns runs the cycle.
//!
//! ## Reachability
//! [`ReachabilitySignal`] is a watch channel. The embedding app can drive
//! it directly, or a [`ReachabilityMonitor`] can ping the Cloud on an
//! interval and drive it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cloud::CloudBackend;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{CycleOutcome, CycleReport, SyncOrchestrator};

// =============================================================================
// Reachability Signal
// =============================================================================

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct ReachabilitySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReachabilitySignal {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        ReachabilitySignal { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "Network reachability changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver that wakes on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ReachabilitySignal {
    fn default() -> Self {
        ReachabilitySignal::new(true)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// What a tick did.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Ran(CycleReport),
    SkippedOffline,
    SkippedBusy,
}

/// Periodic sync driver.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    auto_sync: bool,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler after the current tick.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Scheduler shutdown channel closed".into()))
    }
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        interval: Duration,
        auto_sync: bool,
    ) -> (Self, SchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = Scheduler {
            orchestrator,
            interval,
            auto_sync,
            shutdown_rx,
        };
        (scheduler, SchedulerHandle { shutdown_tx })
    }

    /// One scheduled tick.
    pub async fn tick(&self) -> TickOutcome {
        if !self.orchestrator.reachability().is_online() {
            debug!("Offline, skipping scheduled sync");
            return TickOutcome::SkippedOffline;
        }
        match self.orchestrator.sync_now().await {
            CycleOutcome::Completed(report) => TickOutcome::Ran(report),
            CycleOutcome::Skipped => TickOutcome::SkippedBusy,
        }
    }

    /// Runs until shutdown. The first tick fires immediately.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), auto_sync = self.auto_sync, "Scheduler started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.auto_sync {
                        self.tick().await;
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Reachability Monitor
// =============================================================================

/// Pings the Cloud and feeds the reachability signal.
pub struct ReachabilityMonitor {
    cloud: Arc<dyn CloudBackend>,
    signal: ReachabilitySignal,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the monitor.
#[derive(Clone)]
pub struct ReachabilityMonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ReachabilityMonitorHandle {
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Monitor shutdown channel closed".into()))
    }
}

impl ReachabilityMonitor {
    pub fn new(
        cloud: Arc<dyn CloudBackend>,
        signal: ReachabilitySignal,
        interval: Duration,
    ) -> (Self, ReachabilityMonitorHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let monitor = ReachabilityMonitor {
            cloud,
            signal,
            interval,
            shutdown_rx,
        };
        (monitor, ReachabilityMonitorHandle { shutdown_tx })
    }

    /// Pings once and updates the signal. Returns the new state.
    pub async fn check_once(&self) -> bool {
        let online = match self.cloud.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Cloud unreachable");
                false
            }
        };
        self.signal.set_online(online);
        online
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_once().await;
                }

                _ = self.shutdown_rx.recv() => {
                    debug!("Reachability monitor shutting down");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
