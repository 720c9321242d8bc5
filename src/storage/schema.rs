use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::types::{is_lock_error, DatabaseError};

/// Default number of failures kept per run before the oldest are evicted.
pub const DEFAULT_FAILURE_LIMIT: usize = 100;

/// Default time a claimed queue item stays invisible to other handles.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store: postings, work queue and run ledger.
///
/// Cheap to clone; clones share the pool, the queue wake-up signal and the
/// claim owner id. Each `open` gets a fresh owner id, so two handles on the
/// same file never complete each other's claims.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) queue_signal: Arc<Notify>,
    pub(crate) failure_limit: i64,
    pub(crate) owner: Arc<str>,
    pub(crate) claim_timeout: Duration,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// lock past the busy timeout. Returns `DatabaseError::Other` for other
    /// database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Concurrent workers contend on writes.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // In-memory databases are shared through a single connection that
        // must never be recycled, or the data goes with it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            queue_signal: Arc::new(Notify::new()),
            failure_limit: DEFAULT_FAILURE_LIMIT as i64,
            owner: Arc::from(uuid::Uuid::new_v4().to_string()),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        };
        db.migrate().await.map_err(|e| {
            if is_lock_error(&e.to_string()) {
                DatabaseError::Locked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Cap the number of failures retained per run (minimum 1).
    pub fn with_failure_limit(mut self, limit: usize) -> Self {
        self.failure_limit = limit.max(1) as i64;
        self
    }

    /// How long a claim may stay active before another handle may take the
    /// item back.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Natural key (external_id, source_url) is the only guard against
        // duplicate inserts when workers race on the same posting.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id INTEGER PRIMARY KEY,
                external_id TEXT NOT NULL,
                source_url TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                company TEXT,
                location TEXT,
                employment_type TEXT,
                link TEXT,
                image_url TEXT,
                categories TEXT NOT NULL DEFAULT '[]',
                publish_date INTEGER,
                raw TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(external_id, source_url)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Listing view: most recently updated first
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_postings_updated ON postings(updated_at DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_runs (
                run_id TEXT PRIMARY KEY,
                source_urls TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                total_fetched INTEGER NOT NULL DEFAULT 0,
                total_enqueued INTEGER NOT NULL DEFAULT 0,
                new_count INTEGER NOT NULL DEFAULT 0,
                updated_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_runs_started ON import_runs(started_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Partial index for the staleness sweep
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_runs_open ON import_runs(started_at) WHERE finished_at IS NULL",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_failures (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES import_runs(run_id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_failures_run ON import_failures(run_id, id)",
        )
        .execute(&mut *tx)
        .await?;

        // Work queue. Rows survive completion so that a live key keeps
        // deduplicating until its retention window expires.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_queue (
                id INTEGER PRIMARY KEY,
                source_url TEXT NOT NULL,
                queue_key TEXT NOT NULL,
                run_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER,
                claimed_by TEXT,
                completed_at INTEGER,
                UNIQUE(source_url, queue_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Partial index for claim: pending rows in enqueue order
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_queue_pending ON import_queue(id) WHERE status = 'pending'",
        )
        .execute(&mut *tx)
        .await?;

        // Partial index for expired-claim recovery
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_queue_active ON import_queue(claimed_at) WHERE status = 'active'",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_queue_completed ON import_queue(completed_at) WHERE completed_at IS NOT NULL",
        )
        .execute(&mut *tx)
        .await?;

        // Commit all migrations atomically
        tx.commit().await?;

        Ok(())
    }
}
