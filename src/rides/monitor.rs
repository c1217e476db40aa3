//! Periodic balance enforcement.
//!
//! A sweep walks every open ride and asks the engine to force-terminate the
//! ones whose running cost reached the user's balance. Sweeps are
//! single-flight: a sweep requested while another is running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;

use super::RideEngine;

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Open rides examined.
    pub scanned: usize,
    /// Ids of rides force-terminated.
    pub terminated: Vec<i64>,
    /// Rides whose check failed; retried on the next sweep.
    pub failed: usize,
}

/// Result of [`RideMonitor::sweep`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was in progress.
    Skipped,
    /// The sweep ran.
    Completed(SweepReport),
}

/// Balance-enforcement loop.
pub struct RideMonitor {
    engine: Arc<RideEngine>,
    interval: Duration,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the sweep ends, even on early return.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RideMonitor {
    /// Monitor sweeping every `config.sweep_interval()`.
    pub fn new(engine: Arc<RideEngine>, config: &MonitorConfig) -> Self {
        Self {
            engine,
            interval: config.sweep_interval(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one sweep unless one is already running.
    pub async fn sweep(&self) -> SweepOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sweep already running, skipping");
            return SweepOutcome::Skipped;
        }
        let _guard = SweepGuard(&self.in_flight);

        let mut report = SweepReport::default();
        let rides = match self.engine.open_rides().await {
            Ok(rides) => rides,
            Err(e) => {
                error!(error = %e, "failed to list open rides");
                report.failed = 1;
                return SweepOutcome::Completed(report);
            }
        };
        report.scanned = rides.len();

        for ride in &rides {
            match self.engine.enforce_balance(ride).await {
                Ok(Some(terminated)) => report.terminated.push(terminated.ride.id),
                Ok(None) => {}
                Err(e) if e.is_conflict() => {
                    debug!(ride_id = ride.id, error = %e, "ride changed during sweep");
                }
                Err(e) => {
                    warn!(ride_id = ride.id, error = %e, "balance check failed");
                    report.failed += 1;
                }
            }
        }
        SweepOutcome::Completed(report)
    }

    /// Sweep every interval until `shutdown` flips to true. An in-progress
    /// sweep finishes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.sweep().await {
                    SweepOutcome::Completed(report) if !report.terminated.is_empty() => info!(
                        scanned = report.scanned,
                        terminated = report.terminated.len(),
                        failed = report.failed,
                        "sweep terminated rides"
                    ),
                    SweepOutcome::Completed(report) => debug!(scanned = report.scanned, "sweep clean"),
                    SweepOutcome::Skipped => {}
                },
            }
        }
        info!("ride monitor stopped");
    }
}
