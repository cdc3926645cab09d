//! Postgres-backed implementations of the storage seams defined in
//! `formflow-core`.

use async_trait::async_trait;
use formflow_core::dead_letter::{
    DeadLetterCounts, DeadLetterEntry, DeadLetterStatus, DeadLetterStore, NewDeadLetter,
};
use formflow_core::error::CoreError;
use formflow_core::plugin::{Plugin, PluginSource};
use formflow_core::types::{DbId, Timestamp};

use crate::repositories::{DeadLetterRepo, PluginRepo};
use crate::DbPool;

fn storage(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Dead-letter store
// ---------------------------------------------------------------------------

/// [`DeadLetterStore`] over the `dead_letter_entries` table.
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: DbPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry, CoreError> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize payload: {e}")))?;
        let row = DeadLetterRepo::insert(
            &self.pool,
            entry.plugin_id,
            &entry.table_name,
            &payload,
            &entry.failure_reason,
            entry.next_retry_at,
        )
        .await
        .map_err(storage)?;
        DeadLetterEntry::try_from(row).map_err(CoreError::Internal)
    }

    async fn get(&self, id: DbId) -> Result<Option<DeadLetterEntry>, CoreError> {
        DeadLetterRepo::find_by_id(&self.pool, id)
            .await
            .map_err(storage)?
            .map(DeadLetterEntry::try_from)
            .transpose()
            .map_err(CoreError::Internal)
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        limit_n: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError> {
        let rows = DeadLetterRepo::claim_due(&self.pool, now, limit(limit_n))
            .await
            .map_err(storage)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match DeadLetterEntry::try_from(row) {
                Ok(entry) => entries.push(entry),
                // An unreadable row can never be replayed; park it as
                // exhausted so it stops being claimed.
                Err(reason) => {
                    tracing::error!(entry_id = id, error = %reason, "Unreadable dead-letter entry");
                    sqlx::query(
                        "UPDATE dead_letter_entries SET status = 'exhausted', \
                             next_retry_at = NULL, failure_reason = $2, updated_at = NOW() \
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(&reason)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
                }
            }
        }
        Ok(entries)
    }

    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), CoreError> {
        let found = DeadLetterRepo::update_state(&self.pool, entry)
            .await
            .map_err(storage)?;
        if found {
            Ok(())
        } else {
            Err(CoreError::NotFound {
                entity: "DeadLetterEntry",
                id: entry.id,
            })
        }
    }

    async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit_n: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError> {
        DeadLetterRepo::list_by_status(&self.pool, status.as_str(), limit(limit_n))
            .await
            .map_err(storage)?
            .into_iter()
            .map(DeadLetterEntry::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::Internal)
    }

    async fn count_by_status(&self) -> Result<DeadLetterCounts, CoreError> {
        let rows = DeadLetterRepo::count_by_status(&self.pool)
            .await
            .map_err(storage)?;
        let mut counts = DeadLetterCounts::default();
        for (status, n) in rows {
            let status: DeadLetterStatus = status.parse().map_err(CoreError::Internal)?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn release_stale_claims(&self, older_than: Timestamp) -> Result<u64, CoreError> {
        DeadLetterRepo::release_stale_claims(&self.pool, older_than)
            .await
            .map_err(storage)
    }

    async fn purge_resolved(&self, older_than: Timestamp) -> Result<u64, CoreError> {
        DeadLetterRepo::purge_resolved(&self.pool, older_than)
            .await
            .map_err(storage)
    }
}

// ---------------------------------------------------------------------------
// Plugin source
// ---------------------------------------------------------------------------

/// [`PluginSource`] over the `plugins` table.
#[derive(Debug, Clone)]
pub struct PgPluginSource {
    pool: DbPool,
}

impl PgPluginSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PluginSource for PgPluginSource {
    async fn find_plugin(&self, plugin_id: DbId) -> Result<Option<Plugin>, CoreError> {
        PluginRepo::find_by_id(&self.pool, plugin_id)
            .await
            .map_err(storage)?
            .map(Plugin::try_from)
            .transpose()
            .map_err(CoreError::Validation)
    }
}
