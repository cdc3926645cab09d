//! Repository for the `dead_letter_entries` table.

use formflow_core::dead_letter::DeadLetterEntry;
use formflow_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::dead_letter::DeadLetterRow;

const COLUMNS: &str = "\
    id, plugin_id, table_name, payload, failure_reason, attempt_count, \
    next_retry_at, status, created_at, updated_at, resolved_at";

/// Provides storage operations for dead-letter entries.
pub struct DeadLetterRepo;

impl DeadLetterRepo {
    /// Insert a new `pending` entry with zero attempts.
    pub async fn insert(
        pool: &PgPool,
        plugin_id: DbId,
        table_name: &str,
        payload: &serde_json::Value,
        failure_reason: &str,
        next_retry_at: Timestamp,
    ) -> Result<DeadLetterRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO dead_letter_entries \
                 (plugin_id, table_name, payload, failure_reason, next_retry_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(plugin_id)
            .bind(table_name)
            .bind(payload)
            .bind(failure_reason)
            .bind(next_retry_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<DeadLetterRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dead_letter_entries WHERE id = $1");
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically move due `pending` entries to `retrying` and return them.
    ///
    /// `FOR UPDATE SKIP LOCKED` lets several workers poll concurrently
    /// without handing out the same entry twice.
    pub async fn claim_due(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let query = format!(
            "UPDATE dead_letter_entries SET status = 'retrying', updated_at = $1 \
             WHERE id IN ( \
                 SELECT id FROM dead_letter_entries \
                 WHERE status = 'pending' AND next_retry_at <= $1 \
                 ORDER BY next_retry_at ASC, id ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await?;
        rows.sort_by(|a, b| (a.next_retry_at, a.id).cmp(&(b.next_retry_at, b.id)));
        Ok(rows)
    }

    /// Write back the mutable state of an entry. Returns `false` if the id
    /// does not exist.
    pub async fn update_state(pool: &PgPool, entry: &DeadLetterEntry) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE dead_letter_entries SET \
                 status = $2, \
                 attempt_count = $3, \
                 failure_reason = $4, \
                 next_retry_at = $5, \
                 resolved_at = $6, \
                 updated_at = $7 \
             WHERE id = $1",
        )
        .bind(entry.id)
        .bind(entry.status.as_str())
        .bind(entry.attempt_count as i32)
        .bind(&entry.failure_reason)
        .bind(entry.next_retry_at)
        .bind(entry.resolved_at)
        .bind(entry.updated_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_by_status(
        pool: &PgPool,
        status: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dead_letter_entries \
             WHERE status = $1 ORDER BY id ASC LIMIT $2"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// `(status, count)` pairs for every status that has entries.
    pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM dead_letter_entries GROUP BY status",
        )
        .fetch_all(pool)
        .await
    }

    /// Return entries stuck in `retrying` since before `older_than` to `pending`.
    pub async fn release_stale_claims(
        pool: &PgPool,
        older_than: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE dead_letter_entries SET status = 'pending', updated_at = NOW() \
             WHERE status = 'retrying' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete resolved entries resolved before `older_than`.
    pub async fn purge_resolved(pool: &PgPool, older_than: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM dead_letter_entries \
             WHERE status = 'resolved' AND resolved_at < $1",
        )
        .bind(older_than)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
