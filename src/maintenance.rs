//! Periodic housekeeping outside any run's lifecycle.
//!
//! Closes runs left open past the staleness threshold, returns queue items
//! whose claim expired to pending, and purges completed queue rows whose
//! dedup window has expired. Works only through the ledger's and queue's
//! public operations.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::storage::{Database, DatabaseError};

/// Default period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default age after which an open run is force-closed
pub const DEFAULT_STALE_RUN_AGE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: Duration,
    pub stale_after: Duration,
    pub queue_retention: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_RUN_AGE,
            queue_retention: crate::import::coordinator::DEFAULT_QUEUE_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub closed_runs: u64,
    pub requeued_items: u64,
    pub purged_items: u64,
}

/// One maintenance pass.
pub async fn sweep_once(
    db: &Database,
    settings: &SweepSettings,
) -> Result<SweepReport, DatabaseError> {
    let closed_runs = db.close_stale_runs(settings.stale_after).await?;
    let requeued_items = db.requeue_expired_claims().await?;
    let purged_items = db.purge_completed(settings.queue_retention).await?;

    if closed_runs > 0 || requeued_items > 0 || purged_items > 0 {
        tracing::info!(
            closed_runs = closed_runs,
            requeued_items = requeued_items,
            purged_items = purged_items,
            "Maintenance sweep"
        );
    }
    Ok(SweepReport {
        closed_runs,
        requeued_items,
        purged_items,
    })
}

/// Sweep every `settings.interval` until `shutdown` flips or is dropped.
pub fn spawn_sweeper(
    db: Database,
    settings: SweepSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&db, &settings).await {
                        tracing::warn!(error = %e, "Maintenance sweep failed");
                    }
                }
            }
        }
    })
}
