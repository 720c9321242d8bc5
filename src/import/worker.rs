//! Upsert worker pool: drains the work queue into the posting store.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{EventBroadcaster, ImportEvent};
use crate::storage::{Database, DatabaseError, QueueStatus, QueuedImportItem, RunCounter};

/// Default number of concurrent workers
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default idle poll period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Classification of one processed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    New,
    Updated,
    Failed(String),
}

/// A running pool of queue consumers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers.
    ///
    /// Items whose claim outlived the database's claim timeout are returned
    /// to pending first, so work stranded by a dead process is picked up.
    /// Items claimed recently by another live pool are left to it.
    pub async fn spawn(
        db: Database,
        events: EventBroadcaster,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Result<Self, DatabaseError> {
        let requeued = db.requeue_expired_claims().await?;
        if requeued > 0 {
            tracing::info!(requeued = requeued, "Requeued items with expired claims");
        }

        let (shutdown, rx) = watch::channel(false);
        let handles = (0..concurrency.max(1))
            .map(|worker| {
                let db = db.clone();
                let events = events.clone();
                let rx = rx.clone();
                tokio::spawn(worker_loop(worker, db, events, rx, poll_interval))
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = handles.len(), "Worker pool started");
        Ok(Self { shutdown, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop after in-flight items finish and wait for every worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    db: Database,
    events: EventBroadcaster,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match db.claim_next().await {
            Ok(Some(item)) => {
                let outcome = process_item(&db, &events, &item).await;
                let status = match outcome {
                    ItemOutcome::Failed(_) => QueueStatus::Failed,
                    _ => QueueStatus::Done,
                };
                match db.complete_item(item.id, status).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(worker = worker, item = item.id, "Claim expired before ack");
                    }
                    Err(e) => {
                        tracing::error!(worker = worker, item = item.id, error = %e, "Queue ack failed");
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = worker, error = %e, "Queue claim failed");
            }
        }

        // Idle: wait for new work, the poll period, or shutdown
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = db.queue_notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    tracing::debug!(worker = worker, "Worker exiting");
}

/// Upsert one claimed item, update its run's ledger and publish the outcome.
///
/// Never fails: every error is recorded against the run as a terminal
/// failure for this item.
pub async fn process_item(
    db: &Database,
    events: &EventBroadcaster,
    item: &QueuedImportItem,
) -> ItemOutcome {
    let posting = match item.posting() {
        Ok(posting) => posting,
        Err(e) => {
            let reason = format!("Corrupt queue payload: {e}");
            return fail(db, events, item, &item.queue_key, reason).await;
        }
    };

    let result = async {
        let outcome = db.upsert_posting(&posting).await?;
        let counter = if outcome.was_new {
            RunCounter::New
        } else {
            RunCounter::Updated
        };
        db.increment_run(&item.run_id, counter, 1).await?;
        Ok::<_, DatabaseError>(outcome.was_new)
    }
    .await;

    match result {
        Ok(was_new) => {
            tracing::debug!(
                run_id = %item.run_id,
                external_id = %posting.external_id,
                was_new = was_new,
                "Posting upserted"
            );
            events.publish(&ImportEvent::JobProcessed {
                run_id: item.run_id.clone(),
                external_id: posting.external_id,
                was_new,
            });
            if was_new {
                ItemOutcome::New
            } else {
                ItemOutcome::Updated
            }
        }
        Err(e) => fail(db, events, item, &posting.external_id, e.to_string()).await,
    }
}

async fn fail(
    db: &Database,
    events: &EventBroadcaster,
    item: &QueuedImportItem,
    external_id: &str,
    reason: String,
) -> ItemOutcome {
    tracing::warn!(
        run_id = %item.run_id,
        external_id = %external_id,
        reason = %reason,
        "Posting import failed"
    );

    if let Err(e) = db.record_failure(&item.run_id, external_id, &reason).await {
        tracing::error!(run_id = %item.run_id, error = %e, "Ledger failure write failed");
    }
    events.publish(&ImportEvent::JobFailed {
        run_id: item.run_id.clone(),
        external_id: external_id.to_string(),
        reason: reason.clone(),
    });
    ItemOutcome::Failed(reason)
}
