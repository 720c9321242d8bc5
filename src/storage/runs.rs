use std::collections::HashMap;
use std::time::Duration;

use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    cutoff_millis, now_millis, DatabaseError, ImportRun, ImportRunRow, RunCounter, RunFailure,
    RunFailureRow,
};

/// Default number of runs returned by [`Database::recent_runs`]
pub const DEFAULT_RUN_LIMIT: i64 = 50;

/// Upper bound on a ledger listing (OOM protection)
pub const MAX_RUN_LIMIT: i64 = 500;

const RUN_COLUMNS: &str = "run_id, source_urls, started_at, finished_at, total_fetched, \
     total_enqueued, new_count, updated_count, failed_count";

impl Database {
    // ========================================================================
    // Ledger Mutations
    // ========================================================================
    //
    // Every mutation is a single SQL statement (or one transaction) so that
    // concurrent workers never lose an increment.

    /// Create the ledger row for a run. Fails if `run_id` already exists.
    pub async fn create_run(&self, run_id: &str, source_urls: &[String]) -> Result<(), DatabaseError> {
        let urls = serde_json::to_string(source_urls)?;
        sqlx::query("INSERT INTO import_runs (run_id, source_urls, started_at) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(urls)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    /// Atomically add `by` to one counter of a run.
    pub async fn increment_run(
        &self,
        run_id: &str,
        counter: RunCounter,
        by: i64,
    ) -> Result<(), DatabaseError> {
        // Column names come from a closed enum, never from input
        let column = counter.column();
        let result = sqlx::query(&format!(
            "UPDATE import_runs SET {column} = {column} + ? WHERE run_id = ?"
        ))
        .bind(by)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }

    /// Count one failure against a run and append its reason.
    ///
    /// Only the newest `failure_limit` entries are retained; older ones are
    /// evicted. `failed_count` keeps counting past the cap.
    pub async fn record_failure(
        &self,
        run_id: &str,
        external_id: &str,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let result =
            sqlx::query("UPDATE import_runs SET failed_count = failed_count + 1 WHERE run_id = ?")
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::UnknownRun(run_id.to_string()));
        }

        sqlx::query("INSERT INTO import_failures (run_id, external_id, reason, at) VALUES (?, ?, ?, ?)")
            .bind(run_id)
            .bind(external_id)
            .bind(reason)
            .bind(now_millis())
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        sqlx::query(
            r#"
            DELETE FROM import_failures
            WHERE run_id = ? AND id NOT IN (
                SELECT id FROM import_failures WHERE run_id = ? ORDER BY id DESC LIMIT ?
            )
        "#,
        )
        .bind(run_id)
        .bind(run_id)
        .bind(self.failure_limit)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    /// Mark a run finished. Returns false if it was already finished.
    pub async fn finish_run(&self, run_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE import_runs SET finished_at = ? WHERE run_id = ? AND finished_at IS NULL",
        )
        .bind(now_millis())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Close every open run started more than `older_than` ago.
    ///
    /// Returns the number of runs closed.
    pub async fn close_stale_runs(&self, older_than: Duration) -> Result<u64, DatabaseError> {
        let now = now_millis();
        let cutoff = cutoff_millis(older_than);
        let result = sqlx::query(
            "UPDATE import_runs SET finished_at = ? WHERE finished_at IS NULL AND started_at < ?",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Ledger Queries
    // ========================================================================

    /// Get one run with its retained failures.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<ImportRun>, DatabaseError> {
        let row = sqlx::query_as::<_, ImportRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM import_runs WHERE run_id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let failures = sqlx::query_as::<_, RunFailureRow>(
            "SELECT run_id, external_id, reason, at FROM import_failures WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RunFailureRow::into_failure)
        .collect();

        Ok(Some(row.into_run(failures)))
    }

    /// Most recent runs first, each with its retained failures.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<ImportRun>, DatabaseError> {
        let limit = limit.clamp(1, MAX_RUN_LIMIT);
        let rows = sqlx::query_as::<_, ImportRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM import_runs ORDER BY started_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        // One query for all failures instead of one per run
        let failure_rows: Vec<RunFailureRow> = {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT run_id, external_id, reason, at FROM import_failures WHERE run_id IN (",
            );
            let mut separated = builder.separated(", ");
            for row in &rows {
                separated.push_bind(row.run_id.clone());
            }
            separated.push_unseparated(") ORDER BY id");
            builder.build_query_as().fetch_all(&self.pool).await?
        };

        let mut failures: HashMap<String, Vec<RunFailure>> = HashMap::new();
        for row in failure_rows {
            failures
                .entry(row.run_id.clone())
                .or_default()
                .push(row.into_failure());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let run_failures = failures.remove(&row.run_id).unwrap_or_default();
                row.into_run(run_failures)
            })
            .collect())
    }
}
