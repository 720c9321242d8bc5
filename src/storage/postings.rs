use super::schema::Database;
use super::types::{
    now_millis, DatabaseError, NormalizedPosting, PostingPage, PostingRow, StoredPosting,
    UpsertOutcome,
};

/// Upper bound on a listing page (OOM protection)
pub const MAX_PAGE_SIZE: i64 = 200;

const POSTING_COLUMNS: &str = "id, external_id, source_url, title, description, company, \
     location, employment_type, link, image_url, categories, publish_date, raw, revision, \
     created_at, updated_at";

impl Database {
    // ========================================================================
    // Posting Mutations
    // ========================================================================

    /// Create or fully replace the posting keyed by `(external_id, source_url)`.
    ///
    /// A single `INSERT .. ON CONFLICT DO UPDATE .. RETURNING` statement, so
    /// two workers racing on the same key cannot both insert: the unique index
    /// serializes them and exactly one observes `revision == 1`.
    ///
    /// Every mutable field is overwritten (last write wins); identity fields
    /// and `created_at` are kept.
    pub async fn upsert_posting(
        &self,
        posting: &NormalizedPosting,
    ) -> Result<UpsertOutcome, DatabaseError> {
        let now = now_millis();
        let categories = serde_json::to_string(&posting.categories)?;
        let raw = serde_json::to_string(&posting.raw)?;

        let (id, revision): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO postings (
                external_id, source_url, title, description, company, location,
                employment_type, link, image_url, categories, publish_date, raw,
                revision, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(external_id, source_url) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                company = excluded.company,
                location = excluded.location,
                employment_type = excluded.employment_type,
                link = excluded.link,
                image_url = excluded.image_url,
                categories = excluded.categories,
                publish_date = excluded.publish_date,
                raw = excluded.raw,
                revision = postings.revision + 1,
                updated_at = excluded.updated_at
            RETURNING id, revision
        "#,
        )
        .bind(&posting.external_id)
        .bind(&posting.source_url)
        .bind(&posting.title)
        .bind(&posting.description)
        .bind(&posting.company)
        .bind(&posting.location)
        .bind(&posting.employment_type)
        .bind(&posting.link)
        .bind(&posting.image_url)
        .bind(categories)
        .bind(posting.publish_date.map(|d| d.timestamp_millis()))
        .bind(raw)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            id,
            was_new: revision == 1,
        })
    }

    // ========================================================================
    // Posting Queries
    // ========================================================================

    /// Get a single posting by its row id.
    pub async fn get_posting(&self, id: i64) -> Result<Option<StoredPosting>, DatabaseError> {
        let row = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PostingRow::into_posting))
    }

    /// Get a single posting by its natural key.
    pub async fn find_posting(
        &self,
        external_id: &str,
        source_url: &str,
    ) -> Result<Option<StoredPosting>, DatabaseError> {
        let row = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE external_id = ? AND source_url = ?"
        ))
        .bind(external_id)
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PostingRow::into_posting))
    }

    /// One page of postings, most recently updated first.
    ///
    /// `page` is 1-based; values below 1 are clamped and pages past the end
    /// are empty. `page_size` is capped at [`MAX_PAGE_SIZE`].
    pub async fn list_postings(
        &self,
        page: i64,
        page_size: i64,
    ) -> Result<PostingPage, DatabaseError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM postings")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings \
             ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(page_size)
        .bind((page - 1).saturating_mul(page_size))
        .fetch_all(&self.pool)
        .await?;

        Ok(PostingPage {
            items: rows.into_iter().map(PostingRow::into_posting).collect(),
            page,
            page_size,
            total,
            total_pages: (total + page_size - 1) / page_size,
        })
    }

    /// Total number of stored postings.
    pub async fn count_postings(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM postings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
