use formflow_core::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use formflow_core::types::{DbId, Timestamp};
use formflow_core::value::RowValues;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `dead_letter_entries` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadLetterRow {
    pub id: DbId,
    pub plugin_id: DbId,
    pub table_name: String,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub attempt_count: i32,
    pub next_retry_at: Option<Timestamp>,
    pub status: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = String;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let status: DeadLetterStatus = row.status.parse()?;
        let payload: RowValues = serde_json::from_value(row.payload)
            .map_err(|e| format!("Dead-letter entry {} has an unreadable payload: {e}", row.id))?;

        Ok(DeadLetterEntry {
            id: row.id,
            plugin_id: row.plugin_id,
            table_name: row.table_name,
            payload,
            failure_reason: row.failure_reason,
            attempt_count: row.attempt_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            resolved_at: row.resolved_at,
        })
    }
}
