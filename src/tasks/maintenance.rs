//! Periodic housekeeping: rate-limiter eviction and session index sweeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::middleware::CredentialRateLimiter;
use crate::repository::SessionStore;
use crate::telemetry::record_maintenance_run;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub limiter_keys_evicted: usize,
    pub session_indexes_removed: usize,
    pub failures: usize,
}

struct Inner {
    sessions: Arc<dyn SessionStore>,
    limiter: CredentialRateLimiter,
    interval: Duration,
}

pub struct MaintenanceTask {
    inner: Arc<Inner>,
    started: AtomicBool,
}

/// Running task. Dropping it leaves the loop running; call [`stop`](Self::stop).
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Maintenance task ended abnormally");
        }
    }
}

impl MaintenanceTask {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        limiter: CredentialRateLimiter,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions,
                limiter,
                interval: interval.max(Duration::from_secs(1)),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Starts the loop. Returns `None` if this task was already spawned.
    pub fn spawn(&self) -> Option<MaintenanceHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Maintenance task already running, refusing second spawn");
            return None;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move {
            inner.run(shutdown_rx).await;
        });

        Some(MaintenanceHandle { shutdown, join })
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        self.inner.tick().await
    }
}

impl Inner {
    #[instrument(skip(self, shutdown_rx), name = "maintenance")]
    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Maintenance task started");

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "Maintenance tick finished");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Maintenance task received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Maintenance task stopped");
    }

    async fn tick(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            limiter_keys_evicted: self.limiter.evict_idle(),
            ..Default::default()
        };
        record_maintenance_run("rate_limiter_eviction", true);

        match self.sessions.sweep_dangling_indexes().await {
            Ok(removed) => {
                report.session_indexes_removed = removed;
                if removed > 0 {
                    info!(removed = removed, "Swept dangling session indexes");
                }
                record_maintenance_run("session_index_sweep", true);
            }
            Err(e) => {
                report.failures += 1;
                error!(error = %e, "Session index sweep failed");
                record_maintenance_run("session_index_sweep", false);
            }
        }

        report
    }
}
