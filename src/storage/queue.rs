use std::time::Duration;

use super::schema::Database;
use super::types::{
    cutoff_millis, now_millis, DatabaseError, EnqueueOutcome, NormalizedPosting, QueueStatus,
    QueuedImportItem,
};

impl Database {
    // ========================================================================
    // Producer Side
    // ========================================================================

    /// Add one canonical posting to the durable work queue.
    ///
    /// Deduplicates on `(source_url, queue_key)`: while an item with the same
    /// key is pending, active, or completed within `retention`, the call is a
    /// no-op and returns [`EnqueueOutcome::Duplicate`]. A completed item older
    /// than `retention` is re-armed in place with the new payload.
    pub async fn enqueue_posting(
        &self,
        run_id: &str,
        queue_key: &str,
        posting: &NormalizedPosting,
        retention: Duration,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        let payload = serde_json::to_string(posting)?;
        let now = now_millis();
        let cutoff = cutoff_millis(retention);

        let result = sqlx::query(
            r#"
            INSERT INTO import_queue (source_url, queue_key, run_id, payload, status, enqueued_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(source_url, queue_key) DO UPDATE SET
                run_id = excluded.run_id,
                payload = excluded.payload,
                status = 'pending',
                attempts = 0,
                enqueued_at = excluded.enqueued_at,
                claimed_at = NULL,
                claimed_by = NULL,
                completed_at = NULL
            WHERE import_queue.status IN ('done', 'failed')
              AND import_queue.completed_at < ?
        "#,
        )
        .bind(&posting.source_url)
        .bind(queue_key)
        .bind(run_id)
        .bind(payload)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }

        self.queue_signal.notify_waiters();
        Ok(EnqueueOutcome::Queued)
    }

    // ========================================================================
    // Consumer Side
    // ========================================================================

    /// Atomically claim the oldest pending item, marking it active.
    ///
    /// Returns `None` when the queue has no pending work. Each item is handed
    /// to exactly one caller and stamped with this handle's owner id.
    pub async fn claim_next(&self) -> Result<Option<QueuedImportItem>, DatabaseError> {
        let item = sqlx::query_as::<_, QueuedImportItem>(
            r#"
            UPDATE import_queue
            SET status = 'active', claimed_at = ?, claimed_by = ?, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM import_queue
                WHERE status = 'pending'
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, run_id, source_url, queue_key, payload
        "#,
        )
        .bind(now_millis())
        .bind(&*self.owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(item)
    }

    /// Retire a claimed item as done or failed.
    ///
    /// Only an item still active under this handle's claim is retired.
    /// Returns false when the claim was lost (expired and taken back).
    ///
    /// The row is kept until [`Database::purge_completed`] removes it so its
    /// key keeps deduplicating for the retention window.
    pub async fn complete_item(&self, id: i64, status: QueueStatus) -> Result<bool, DatabaseError> {
        debug_assert!(matches!(status, QueueStatus::Done | QueueStatus::Failed));

        let result = sqlx::query(
            r#"
            UPDATE import_queue SET status = ?, completed_at = ?
            WHERE id = ? AND status = 'active' AND claimed_by = ?
        "#,
        )
        .bind(status.as_str())
        .bind(now_millis())
        .bind(id)
        .bind(&*self.owner)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Return items whose claim is older than the claim timeout to pending.
    ///
    /// A live worker acks well inside the timeout, so an item past it belongs
    /// to a worker that died. Fresh claims, from this handle or any other
    /// process on the same file, are left alone.
    pub async fn requeue_expired_claims(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE import_queue SET status = 'pending', claimed_at = NULL, claimed_by = NULL
            WHERE status = 'active' AND claimed_at < ?
        "#,
        )
        .bind(cutoff_millis(self.claim_timeout))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() > 0 {
            self.queue_signal.notify_waiters();
        }
        Ok(result.rows_affected())
    }

    /// Number of items not yet retired (pending plus active).
    pub async fn queue_depth(&self) -> Result<i64, DatabaseError> {
        let (depth,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM import_queue WHERE status IN ('pending', 'active')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    /// Delete completed items older than `older_than`, releasing their keys.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64, DatabaseError> {
        let cutoff = cutoff_millis(older_than);
        let result = sqlx::query(
            "DELETE FROM import_queue WHERE status IN ('done', 'failed') AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Wait until a producer enqueues new work.
    ///
    /// Wake-ups are best-effort; consumers still poll on an interval.
    pub async fn queue_notified(&self) {
        self.queue_signal.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FEED: &str = "https://example.com/feed";
    const RETENTION: Duration = Duration::from_secs(30 * 60);

    fn posting(external_id: &str) -> NormalizedPosting {
        NormalizedPosting {
            external_id: external_id.to_string(),
            source_url: FEED.to_string(),
            title: format!("Job {external_id}"),
            description: String::new(),
            company: None,
            location: None,
            employment_type: None,
            link: None,
            image_url: None,
            categories: vec![],
            publish_date: None,
            raw: serde_json::json!({}),
        }
    }

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_then_claim() {
        let db = test_db().await;
        let outcome = db
            .enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(db.queue_depth().await.unwrap(), 1);

        let item = db.claim_next().await.unwrap().unwrap();
        assert_eq!(item.run_id, "run-1");
        assert_eq!(item.queue_key, "1");
        assert_eq!(item.source_url, FEED);
        assert_eq!(item.posting().unwrap(), posting("1"));

        // Active items are not handed out twice
        assert!(db.claim_next().await.unwrap().is_none());
        assert_eq!(db.queue_depth().await.unwrap(), 1);

        assert!(db.complete_item(item.id, QueueStatus::Done).await.unwrap());
        assert_eq!(db.queue_depth().await.unwrap(), 0);

        // A second ack is refused
        assert!(!db.complete_item(item.id, QueueStatus::Done).await.unwrap());
    }

    #[tokio::test]
    async fn test_claims_in_enqueue_order() {
        let db = test_db().await;
        for key in ["c", "a", "b"] {
            db.enqueue_posting("run-1", key, &posting(key), RETENTION)
                .await
                .unwrap();
        }
        let mut keys = Vec::new();
        while let Some(item) = db.claim_next().await.unwrap() {
            keys.push(item.queue_key);
        }
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_key_while_live() {
        let db = test_db().await;
        assert_eq!(
            db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
                .await
                .unwrap(),
            EnqueueOutcome::Queued
        );
        // Pending
        assert_eq!(
            db.enqueue_posting("run-2", "1", &posting("1"), RETENTION)
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate
        );

        // Active
        let item = db.claim_next().await.unwrap().unwrap();
        assert_eq!(
            db.enqueue_posting("run-2", "1", &posting("1"), RETENTION)
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate
        );

        // Recently completed
        db.complete_item(item.id, QueueStatus::Done).await.unwrap();
        assert_eq!(
            db.enqueue_posting("run-2", "1", &posting("1"), RETENTION)
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert!(db.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_key_other_source_is_not_duplicate() {
        let db = test_db().await;
        let mut other = posting("1");
        other.source_url = "https://other.example.com/feed".to_string();

        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        let outcome = db
            .enqueue_posting("run-1", "1", &other, RETENTION)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(db.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expired_key_is_rearmed() {
        let db = test_db().await;
        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        let item = db.claim_next().await.unwrap().unwrap();
        db.complete_item(item.id, QueueStatus::Failed).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut updated = posting("1");
        updated.title = "Updated".to_string();
        let outcome = db
            .enqueue_posting("run-2", "1", &updated, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);

        let again = db.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.run_id, "run-2");
        assert_eq!(again.posting().unwrap().title, "Updated");
    }

    #[tokio::test]
    async fn test_purge_completed_releases_keys() {
        let db = test_db().await;
        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        db.enqueue_posting("run-1", "2", &posting("2"), RETENTION)
            .await
            .unwrap();
        let item = db.claim_next().await.unwrap().unwrap();
        db.complete_item(item.id, QueueStatus::Done).await.unwrap();

        // Inside retention nothing is purged
        assert_eq!(db.purge_completed(RETENTION).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(db.purge_completed(Duration::ZERO).await.unwrap(), 1);
        // Pending items are never purged
        assert_eq!(db.queue_depth().await.unwrap(), 1);

        let outcome = db
            .enqueue_posting("run-2", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);
    }

    #[tokio::test]
    async fn test_fresh_claims_are_not_requeued() {
        let db = test_db().await;
        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        db.claim_next().await.unwrap().unwrap();

        assert_eq!(db.requeue_expired_claims().await.unwrap(), 0);
        assert!(db.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_claim_is_requeued_and_old_ack_refused() {
        let db = test_db().await.with_claim_timeout(Duration::ZERO);
        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        let first = db.claim_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(db.requeue_expired_claims().await.unwrap(), 1);
        let second = db.claim_next().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert!(db.complete_item(second.id, QueueStatus::Done).await.unwrap());
        assert_eq!(db.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_huge_ages_saturate() {
        let db = test_db().await.with_claim_timeout(Duration::MAX);
        db.enqueue_posting("run-1", "1", &posting("1"), Duration::MAX)
            .await
            .unwrap();
        let item = db.claim_next().await.unwrap().unwrap();
        assert_eq!(db.requeue_expired_claims().await.unwrap(), 0);
        db.complete_item(item.id, QueueStatus::Done).await.unwrap();

        assert_eq!(db.purge_completed(Duration::MAX).await.unwrap(), 0);
        assert_eq!(
            db.enqueue_posting("run-2", "1", &posting("1"), Duration::MAX)
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let db = test_db().await;
        for i in 0..20 {
            let key = i.to_string();
            db.enqueue_posting("run-1", &key, &posting(&key), RETENTION)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(item) = db.claim_next().await.unwrap() {
                    ids.push(item.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let db = test_db().await;
        let waiter = {
            let db = db.clone();
            tokio::spawn(async move { db.queue_notified().await })
        };
        // Let the waiter register before producing
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        db.enqueue_posting("run-1", "1", &posting("1"), RETENTION)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
