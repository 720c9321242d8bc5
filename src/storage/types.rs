use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock past the busy timeout
    #[error("The database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A counter or failure was recorded against a run that does not exist
    #[error("Unknown import run: {0}")]
    UnknownRun(String),

    /// A stored JSON column could not be encoded or decoded
    #[error("Payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::Locked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) surface only as message text through sqlx.
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
}

// ============================================================================
// Postings
// ============================================================================

/// The canonical, source-agnostic shape of one job posting.
///
/// `(external_id, source_url)` is the natural key. `raw` is the untouched feed
/// entry, kept for audit and backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPosting {
    pub external_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub categories: Vec<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// A persisted posting plus system timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPosting {
    pub id: i64,
    pub external_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub categories: Vec<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
    /// Number of times this posting has been written; 1 means never replaced
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a single create-or-replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub was_new: bool,
}

/// One page of postings, most recently updated first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingPage {
    pub items: Vec<StoredPosting>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

/// Internal row type for posting queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostingRow {
    pub id: i64,
    pub external_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub categories: String,
    pub publish_date: Option<i64>,
    pub raw: String,
    pub revision: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PostingRow {
    pub(crate) fn into_posting(self) -> StoredPosting {
        let categories = serde_json::from_str(&self.categories).unwrap_or_else(|e| {
            tracing::warn!(id = self.id, error = %e, "Corrupt categories column, treating as empty");
            Vec::new()
        });
        let raw = serde_json::from_str(&self.raw).unwrap_or_else(|e| {
            tracing::warn!(id = self.id, error = %e, "Corrupt raw column, treating as null");
            serde_json::Value::Null
        });

        StoredPosting {
            id: self.id,
            external_id: self.external_id,
            source_url: self.source_url,
            title: self.title,
            description: self.description,
            company: self.company,
            location: self.location,
            employment_type: self.employment_type,
            link: self.link,
            image_url: self.image_url,
            categories,
            publish_date: self.publish_date.and_then(DateTime::from_timestamp_millis),
            raw,
            revision: self.revision,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

// ============================================================================
// Work Queue
// ============================================================================

/// Lifecycle of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Active,
    Done,
    Failed,
}

impl QueueStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Active => "active",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }
}

/// Whether an enqueue placed new work or hit a live key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
}

/// An item claimed from the work queue, awaiting ack.
///
/// The posting is kept as its serialized payload so that a corrupt row can
/// still be acked and reported by its key.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedImportItem {
    pub id: i64,
    pub run_id: String,
    pub source_url: String,
    pub queue_key: String,
    pub payload: String,
}

impl QueuedImportItem {
    pub fn posting(&self) -> Result<NormalizedPosting, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

// ============================================================================
// Run Ledger
// ============================================================================

/// Ledger counters that can be atomically incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCounter {
    Fetched,
    Enqueued,
    New,
    Updated,
    Failed,
}

impl RunCounter {
    pub(crate) fn column(self) -> &'static str {
        match self {
            RunCounter::Fetched => "total_fetched",
            RunCounter::Enqueued => "total_enqueued",
            RunCounter::New => "new_count",
            RunCounter::Updated => "updated_count",
            RunCounter::Failed => "failed_count",
        }
    }
}

/// One recorded failure within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub external_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Aggregate record of one import run.
///
/// `finished_at` is advisory: the staleness sweep may close a run while
/// workers are still retiring its last items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub run_id: String,
    pub source_urls: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_fetched: i64,
    pub total_enqueued: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    /// Most recent failures, oldest first
    pub failures: Vec<RunFailure>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ImportRunRow {
    pub run_id: String,
    pub source_urls: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub total_fetched: i64,
    pub total_enqueued: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
}

impl ImportRunRow {
    pub(crate) fn into_run(self, failures: Vec<RunFailure>) -> ImportRun {
        let source_urls = serde_json::from_str(&self.source_urls).unwrap_or_else(|e| {
            tracing::warn!(run_id = %self.run_id, error = %e, "Corrupt source_urls column");
            Vec::new()
        });
        ImportRun {
            run_id: self.run_id,
            source_urls,
            started_at: from_millis(self.started_at),
            finished_at: self.finished_at.map(from_millis),
            total_fetched: self.total_fetched,
            total_enqueued: self.total_enqueued,
            new_count: self.new_count,
            updated_count: self.updated_count,
            failed_count: self.failed_count,
            failures,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunFailureRow {
    pub run_id: String,
    pub external_id: String,
    pub reason: String,
    pub at: i64,
}

impl RunFailureRow {
    pub(crate) fn into_failure(self) -> RunFailure {
        RunFailure {
            external_id: self.external_id,
            reason: self.reason,
            at: from_millis(self.at),
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// All timestamps are stored as Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Millisecond timestamp `age` before now, saturating instead of overflowing.
pub(crate) fn cutoff_millis(age: Duration) -> i64 {
    let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_sub(age)
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
