//! Recurring import trigger.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::coordinator::Coordinator;

/// Default period between scheduled runs
pub const DEFAULT_IMPORT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Start a run over `feed_urls` every `interval`.
///
/// The first scheduled run happens one interval after start unless
/// `run_on_startup` is set. Missed ticks are skipped rather than bunched.
/// The task stops when `shutdown` flips to true or its sender is dropped.
pub fn spawn_schedule(
    coordinator: Coordinator,
    feed_urls: Vec<String>,
    interval: Duration,
    run_on_startup: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = if run_on_startup {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + interval
        };
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Scheduled and on-demand triggers are the same call
                    match coordinator.start_run(feed_urls.clone()).await {
                        Ok(started) => {
                            tracing::info!(run_id = %started.run_id, "Scheduled import started");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Scheduled import could not start");
                        }
                    }
                }
            }
        }
        tracing::debug!("Import schedule stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::import::ImportSettings;
    use crate::storage::Database;

    async fn coordinator() -> (Database, Coordinator) {
        let db = Database::open(":memory:").await.unwrap();
        let coordinator = Coordinator::new(
            db.clone(),
            reqwest::Client::new(),
            EventBroadcaster::default(),
            ImportSettings::default(),
        );
        (db, coordinator)
    }

    async fn run_count(db: &Database) -> usize {
        db.recent_runs(100).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_runs_on_startup_and_each_interval() {
        let (db, coordinator) = coordinator().await;
        let (tx, rx) = watch::channel(false);

        let handle = spawn_schedule(coordinator, Vec::new(), Duration::from_millis(50), true, rx);
        tokio::time::sleep(Duration::from_millis(130)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let runs = run_count(&db).await;
        assert!(runs >= 2, "expected at least two runs, got {runs}");
    }

    #[tokio::test]
    async fn test_waits_one_interval_without_startup_run() {
        let (db, coordinator) = coordinator().await;
        let (tx, rx) = watch::channel(false);

        let handle = spawn_schedule(coordinator, Vec::new(), Duration::from_secs(3600), false, rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(run_count(&db).await, 0);
    }
}
