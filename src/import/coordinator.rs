//! One import run: fetch every source, canonicalize, and enqueue in batches.

use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use super::queue_key::queue_key;
use crate::events::{EventBroadcaster, ImportEvent};
use crate::feed::{canonicalize, fetch_document, FetchLimits};
use crate::storage::{Database, DatabaseError, EnqueueOutcome, NormalizedPosting, RunCounter};

/// Default number of postings per enqueue batch
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default time a completed queue key keeps deduplicating
pub const DEFAULT_QUEUE_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Tunables for a run.
#[derive(Debug, Clone, Copy)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub fetch: FetchLimits,
    pub queue_retention: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            fetch: FetchLimits::default(),
            queue_retention: DEFAULT_QUEUE_RETENTION,
        }
    }
}

/// What the producer side of one run did. Worker outcomes live in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub fetched: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub enqueue_failures: usize,
}

/// A run whose ledger row exists and whose sources are being processed.
pub struct StartedRun {
    pub run_id: String,
    pub handle: JoinHandle<RunSummary>,
}

/// Drives import runs. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    db: Database,
    client: reqwest::Client,
    events: EventBroadcaster,
    settings: ImportSettings,
}

impl Coordinator {
    pub fn new(
        db: Database,
        client: reqwest::Client,
        events: EventBroadcaster,
        settings: ImportSettings,
    ) -> Self {
        let settings = ImportSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        Self {
            db,
            client,
            events,
            settings,
        }
    }

    /// Create the run's ledger row, then process its sources in the background.
    ///
    /// The returned run id is queryable as soon as this returns. Only failure
    /// to create the ledger row is an error; everything after that is
    /// recorded on the run.
    pub async fn start_run(&self, feed_urls: Vec<String>) -> Result<StartedRun, DatabaseError> {
        let run_id = self.begin(&feed_urls).await?;
        let this = self.clone();
        let id = run_id.clone();
        let handle = tokio::spawn(async move { this.process_sources(id, feed_urls).await });
        Ok(StartedRun { run_id, handle })
    }

    /// Create the ledger row and process every source before returning.
    pub async fn run(&self, feed_urls: Vec<String>) -> Result<RunSummary, DatabaseError> {
        let run_id = self.begin(&feed_urls).await?;
        Ok(self.process_sources(run_id, feed_urls).await)
    }

    async fn begin(&self, feed_urls: &[String]) -> Result<String, DatabaseError> {
        let run_id = Uuid::new_v4().to_string();
        self.db.create_run(&run_id, feed_urls).await?;

        tracing::info!(run_id = %run_id, sources = feed_urls.len(), "Import run started");
        self.events.publish(&ImportEvent::ImportRunStarted {
            run_id: run_id.clone(),
        });
        Ok(run_id)
    }

    async fn process_sources(&self, run_id: String, feed_urls: Vec<String>) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            ..RunSummary::default()
        };

        // Sources are processed one at a time; workers drain concurrently
        for url in &feed_urls {
            self.process_source(url, &mut summary).await;
        }

        tracing::info!(
            run_id = %summary.run_id,
            sources_ok = summary.sources_ok,
            sources_failed = summary.sources_failed,
            fetched = summary.fetched,
            enqueued = summary.enqueued,
            duplicates = summary.duplicates,
            "Import run sources processed"
        );
        summary
    }

    async fn process_source(&self, url: &str, summary: &mut RunSummary) {
        let run_id = summary.run_id.clone();

        let document = match fetch_document(&self.client, url, self.settings.fetch).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(run_id = %run_id, feed = %url, error = %e, "Feed source failed");
                summary.sources_failed += 1;
                self.record_failure(&run_id, url, &e.to_string()).await;
                return;
            }
        };

        let mut fetched = 0usize;
        let mut dropped = 0usize;
        let mut batch: Vec<NormalizedPosting> = Vec::with_capacity(self.settings.batch_size);

        for entry in document.entries() {
            let Some(posting) = canonicalize(url, entry) else {
                dropped += 1;
                continue;
            };
            fetched += 1;
            batch.push(posting);

            if batch.len() >= self.settings.batch_size {
                self.enqueue_batch(&run_id, &mut batch, summary).await;
            }
        }
        if !batch.is_empty() {
            self.enqueue_batch(&run_id, &mut batch, summary).await;
        }

        if dropped > 0 {
            tracing::debug!(feed = %url, dropped = dropped, "Entries without identity dropped");
        }
        tracing::info!(run_id = %run_id, feed = %url, fetched = fetched, "Feed source processed");

        summary.sources_ok += 1;
        summary.fetched += fetched;
        if fetched > 0 {
            self.increment(&run_id, RunCounter::Fetched, fetched).await;
        }
    }

    /// Enqueue each posting under its queue key, then count the successes
    /// with one ledger increment.
    async fn enqueue_batch(
        &self,
        run_id: &str,
        batch: &mut Vec<NormalizedPosting>,
        summary: &mut RunSummary,
    ) {
        let mut queued = 0usize;

        for posting in batch.drain(..) {
            let key = queue_key(&posting.external_id);
            match self
                .db
                .enqueue_posting(run_id, &key, &posting, self.settings.queue_retention)
                .await
            {
                Ok(EnqueueOutcome::Queued) => queued += 1,
                Ok(EnqueueOutcome::Duplicate) => {
                    tracing::debug!(run_id = %run_id, queue_key = %key, "Duplicate queue key skipped");
                    summary.duplicates += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        external_id = %posting.external_id,
                        error = %e,
                        "Enqueue failed"
                    );
                    summary.enqueue_failures += 1;
                    self.record_failure(run_id, &posting.external_id, &format!("enqueue: {e}"))
                        .await;
                }
            }
        }

        summary.enqueued += queued;
        if queued > 0 {
            self.increment(run_id, RunCounter::Enqueued, queued).await;
        }
    }

    async fn increment(&self, run_id: &str, counter: RunCounter, by: usize) {
        if let Err(e) = self.db.increment_run(run_id, counter, by as i64).await {
            tracing::error!(run_id = %run_id, counter = ?counter, error = %e, "Ledger increment failed");
        }
    }

    async fn record_failure(&self, run_id: &str, external_id: &str, reason: &str) {
        if let Err(e) = self.db.record_failure(run_id, external_id, reason).await {
            tracing::error!(run_id = %run_id, error = %e, "Ledger failure write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(items: &[(&str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(guid, title)| format!("<item><guid>{guid}</guid><title>{title}</title></item>"))
            .collect();
        format!(r#"<?xml version="1.0"?><rss version="2.0"><channel>{body}</channel></rss>"#)
    }

    async fn mount(server: &MockServer, route: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(template)
            .mount(server)
            .await;
    }

    async fn coordinator(batch_size: usize) -> (Database, Coordinator) {
        let db = Database::open(":memory:").await.unwrap();
        let settings = ImportSettings {
            batch_size,
            ..ImportSettings::default()
        };
        let coordinator = Coordinator::new(
            db.clone(),
            reqwest::Client::new(),
            EventBroadcaster::default(),
            settings,
        );
        (db, coordinator)
    }

    #[tokio::test]
    async fn test_run_enqueues_every_identified_entry() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/a",
            ResponseTemplate::new(200).set_body_string(rss(&[("1", "One"), ("2", "Two")])),
        )
        .await;
        mount(
            &server,
            "/b",
            ResponseTemplate::new(200).set_body_string(rss(&[("3", "Three")])),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let urls = vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())];
        let summary = coordinator.run(urls.clone()).await.unwrap();

        assert_eq!(summary.sources_ok, 2);
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.enqueued, 3);
        assert_eq!(db.queue_depth().await.unwrap(), 3);

        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.source_urls, urls);
        assert_eq!(run.total_fetched, 3);
        assert_eq!(run.total_enqueued, 3);
        assert_eq!(run.failed_count, 0);
    }

    #[tokio::test]
    async fn test_failing_source_does_not_abort_run() {
        let server = MockServer::start().await;
        mount(&server, "/broken", ResponseTemplate::new(500)).await;
        mount(
            &server,
            "/ok",
            ResponseTemplate::new(200).set_body_string(rss(&[("1", "One")])),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let broken = format!("{}/broken", server.uri());
        let summary = coordinator
            .run(vec![broken.clone(), format!("{}/ok", server.uri())])
            .await
            .unwrap();

        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.sources_ok, 1);

        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 1);
        assert_eq!(run.failed_count, 1);
        assert_eq!(run.failures[0].external_id, broken);
        assert!(run.failures[0].reason.contains("500"));
    }

    #[tokio::test]
    async fn test_unparseable_source_is_recorded() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/garbage",
            ResponseTemplate::new(200).set_body_string("<rss><channel>"),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let summary = coordinator
            .run(vec![format!("{}/garbage", server.uri())])
            .await
            .unwrap();

        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.failed_count, 1);
        assert!(run.failures[0].reason.starts_with("Parse error"));
    }

    #[tokio::test]
    async fn test_identity_less_entries_are_dropped_silently() {
        let server = MockServer::start().await;
        let body = r#"<rss><channel>
            <item><title>No identity</title></item>
            <item><guid>1</guid><title>Has identity</title></item>
        </channel></rss>"#;
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(body)).await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let summary = coordinator
            .run(vec![format!("{}/feed", server.uri())])
            .await
            .unwrap();

        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 1);
        assert_eq!(run.total_enqueued, 1);
        assert_eq!(run.failed_count, 0);
    }

    #[tokio::test]
    async fn test_batches_flush_at_threshold_and_remainder() {
        let server = MockServer::start().await;
        let items: Vec<(String, String)> =
            (0..7).map(|i| (i.to_string(), format!("Job {i}"))).collect();
        let refs: Vec<(&str, &str)> = items.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(rss(&refs))).await;

        let (db, coordinator) = coordinator(3).await;
        let summary = coordinator
            .run(vec![format!("{}/feed", server.uri())])
            .await
            .unwrap();

        assert_eq!(summary.enqueued, 7);
        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_enqueued, 7);
        assert_eq!(db.queue_depth().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_overlapping_runs_do_not_duplicate_work() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string(rss(&[("1", "One"), ("2", "Two")])),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let urls = vec![format!("{}/feed", server.uri())];
        let first = coordinator.run(urls.clone()).await.unwrap();
        let second = coordinator.run(urls).await.unwrap();

        assert_eq!(first.enqueued, 2);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(db.queue_depth().await.unwrap(), 2);

        let run = db.get_run(&second.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 2);
        assert_eq!(run.total_enqueued, 0);
    }

    #[tokio::test]
    async fn test_start_run_is_observable_immediately() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(rss(&[("1", "One")]))
                .set_delay(Duration::from_millis(200)),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let started = coordinator
            .start_run(vec![format!("{}/slow", server.uri())])
            .await
            .unwrap();

        let run = db.get_run(&started.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 0);

        let summary = started.handle.await.unwrap();
        assert_eq!(summary.run_id, started.run_id);
        assert_eq!(summary.fetched, 1);
    }

    #[tokio::test]
    async fn test_run_started_event_published() {
        let (_db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        let mut sub = coordinator.events.subscribe().unwrap();
        sub.recv().await.unwrap(); // connected

        let summary = coordinator.run(Vec::new()).await.unwrap();
        let frame = sub.recv().await.unwrap();
        assert_eq!(
            &*frame,
            format!(
                "event: importRunStarted\ndata: {{\"runId\":\"{}\"}}\n\n",
                summary.run_id
            )
        );
    }

    #[tokio::test]
    async fn test_enqueue_failures_recorded_and_batch_continues() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string(rss(&[
                ("bad-1", "One"),
                ("ok-1", "Two"),
                ("bad-2", "Three"),
                ("ok-2", "Four"),
            ])),
        )
        .await;

        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_bad_keys BEFORE INSERT ON import_queue
            WHEN NEW.queue_key LIKE 'bad%'
            BEGIN SELECT RAISE(ABORT, 'queue rejected item'); END
        "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let summary = coordinator
            .run(vec![format!("{}/feed", server.uri())])
            .await
            .unwrap();
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.enqueue_failures, 2);
        assert_eq!(db.queue_depth().await.unwrap(), 2);

        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 4);
        assert_eq!(run.total_enqueued, 2);
        assert_eq!(run.failed_count, 2);
        let failed: Vec<_> = run.failures.iter().map(|f| f.external_id.as_str()).collect();
        assert_eq!(failed, vec!["bad-1", "bad-2"]);
        assert!(run.failures.iter().all(|f| f.reason.starts_with("enqueue: ")));
    }

    #[tokio::test]
    async fn test_every_enqueue_failing_counts_nothing_enqueued() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string(rss(&[("1", "One"), ("2", "Two")])),
        )
        .await;

        let (db, coordinator) = coordinator(1).await;
        sqlx::query("DROP TABLE import_queue")
            .execute(&db.pool)
            .await
            .unwrap();

        let summary = coordinator
            .run(vec![format!("{}/feed", server.uri())])
            .await
            .unwrap();
        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.total_fetched, 2);
        assert_eq!(run.total_enqueued, 0);
        assert_eq!(run.failed_count, 2);
        assert!(run.failures.iter().all(|f| f.reason.starts_with("enqueue")));
    }

    #[tokio::test]
    async fn test_ledger_creation_failure_aborts() {
        let (db, coordinator) = coordinator(DEFAULT_BATCH_SIZE).await;
        sqlx::query("DROP TABLE import_failures")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("DROP TABLE import_runs")
            .execute(&db.pool)
            .await
            .unwrap();

        assert!(coordinator.run(vec!["https://example.com/feed".into()]).await.is_err());
    }
}
