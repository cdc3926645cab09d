//! Writing extracted fields into a plugin's external tables.
//!
//! A call routes each extracted field to a declared table and column,
//! coerces it, and inserts each table's rows in its own transaction. Tables
//! succeed or fail independently; a failed table's rows are rolled back and
//! dead-lettered one by one. When all tables are done an outcome webhook is
//! sent in the background.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use formflow_connectors::{run_in_transaction, ConnectorError, ConnectorFactory, GuardedConnector};
use formflow_core::plugin::{ExtractedFields, Plugin, PluginField, PluginTable};
use formflow_core::types::DbId;
use formflow_core::value::RowValues;
use formflow_events::{WebhookEvent, WebhookService};
use serde::Serialize;

use crate::coercion::{coerce_row, FieldError};
use crate::dead_letter::DeadLetterQueue;
use crate::error::PopulationError;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PopulationSettings {
    /// Upper bound on one table's transaction. `None` waits indefinitely.
    pub transaction_timeout: Option<Duration>,
}

impl Default for PopulationSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: Some(Duration::from_secs(30)),
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PopulationStatus {
    Success,
    Partial,
    Failed,
}

impl PopulationStatus {
    pub fn webhook_event(&self) -> WebhookEvent {
        match self {
            Self::Success => WebhookEvent::PopulationSuccess,
            Self::Partial => WebhookEvent::PopulationPartial,
            Self::Failed => WebhookEvent::PopulationFailed,
        }
    }
}

/// Outcome for one target table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub inserted: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopulationResult {
    pub plugin_id: DbId,
    /// Rows written across all tables.
    pub inserted: u64,
    /// Rows rolled back across all tables.
    pub failed: u64,
    /// Tables that had at least one row to insert, in declaration order.
    pub tables: Vec<TableOutcome>,
    /// Fields dropped during coercion. Their rows were still inserted.
    pub field_errors: Vec<FieldError>,
    /// Failed rows successfully recorded in the dead-letter queue.
    pub dead_lettered: u64,
}

impl PopulationResult {
    fn empty(plugin_id: DbId) -> Self {
        Self {
            plugin_id,
            inserted: 0,
            failed: 0,
            tables: Vec::new(),
            field_errors: Vec::new(),
            dead_lettered: 0,
        }
    }

    /// `Success` when nothing failed (including when nothing was attempted).
    pub fn status(&self) -> PopulationStatus {
        if self.failed == 0 {
            PopulationStatus::Success
        } else if self.inserted == 0 {
            PopulationStatus::Failed
        } else {
            PopulationStatus::Partial
        }
    }

    fn webhook_data(&self) -> serde_json::Value {
        serde_json::json!({
            "plugin_id": self.plugin_id,
            "inserted": self.inserted,
            "failed": self.failed,
            "tables": self.tables,
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct PopulationService {
    factory: Arc<ConnectorFactory>,
    dead_letters: Arc<DeadLetterQueue>,
    webhooks: Arc<WebhookService>,
    settings: PopulationSettings,
}

impl PopulationService {
    pub fn new(
        factory: Arc<ConnectorFactory>,
        dead_letters: Arc<DeadLetterQueue>,
        webhooks: Arc<WebhookService>,
        settings: PopulationSettings,
    ) -> Self {
        Self {
            factory,
            dead_letters,
            webhooks,
            settings,
        }
    }

    /// Insert one session's extracted fields.
    pub async fn populate(
        &self,
        plugin: &Plugin,
        fields: &ExtractedFields,
    ) -> Result<PopulationResult, PopulationError> {
        self.populate_batch(plugin, std::slice::from_ref(fields)).await
    }

    /// Insert several sessions' fields, one row per session per table.
    ///
    /// All rows for a table share one transaction.
    pub async fn populate_batch(
        &self,
        plugin: &Plugin,
        submissions: &[ExtractedFields],
    ) -> Result<PopulationResult, PopulationError> {
        if !plugin.is_active {
            return Err(PopulationError::PluginInactive(plugin.id));
        }
        if plugin.tables.is_empty() {
            return Err(PopulationError::NoTables(plugin.id));
        }

        let mut result = PopulationResult::empty(plugin.id);
        let mut batches: Vec<Vec<RowValues>> = vec![Vec::new(); plugin.tables.len()];

        for fields in submissions {
            for (idx, values) in route_fields(plugin, fields).into_iter().enumerate() {
                if values.is_empty() {
                    continue;
                }
                let (row, errors) = coerce_row(&plugin.tables[idx], values);
                result.field_errors.extend(errors);
                if !row.is_empty() {
                    batches[idx].push(row);
                }
            }
        }

        if batches.iter().all(Vec::is_empty) {
            tracing::debug!(
                plugin_id = plugin.id,
                field_errors = result.field_errors.len(),
                "Nothing to insert"
            );
            return Ok(result);
        }

        let connector = self.factory.for_plugin(plugin).await;
        for (table, rows) in plugin.tables.iter().zip(batches) {
            if rows.is_empty() {
                continue;
            }
            let (outcome, dead_lettered) = self
                .insert_table(&connector, plugin.id, &table.table_name, rows)
                .await;
            result.inserted += outcome.inserted;
            result.failed += outcome.failed;
            result.dead_lettered += dead_lettered;
            result.tables.push(outcome);
        }

        let status = result.status();
        tracing::info!(
            plugin_id = plugin.id,
            status = ?status,
            inserted = result.inserted,
            failed = result.failed,
            dead_lettered = result.dead_lettered,
            field_errors = result.field_errors.len(),
            "Population finished"
        );

        self.webhooks.send_batch_fire_and_forget(
            plugin.id,
            &plugin.webhooks,
            status.webhook_event(),
            result.webhook_data(),
        );

        Ok(result)
    }

    /// Insert all rows for one table in a single transaction.
    ///
    /// Returns the outcome and how many failed rows reached the dead-letter
    /// queue.
    async fn insert_table(
        &self,
        connector: &GuardedConnector,
        plugin_id: DbId,
        table: &str,
        rows: Vec<RowValues>,
    ) -> (TableOutcome, u64) {
        let row_count = rows.len() as u64;
        let groups = Arc::new(group_by_columns(rows));

        let tx_groups = Arc::clone(&groups);
        let tx_table = table.to_string();
        let tx_result = run_in_transaction(
            connector,
            self.settings.transaction_timeout,
            move |tx| {
                Box::pin(async move {
                    let mut inserted = 0;
                    for group in tx_groups.iter() {
                        inserted += tx.execute_insert_many(&tx_table, group).await?;
                    }
                    Ok(inserted)
                })
            },
        )
        .await;

        match tx_result {
            Ok(inserted) => {
                tracing::debug!(plugin_id, table, inserted, "Table populated");
                (
                    TableOutcome {
                        table: table.to_string(),
                        inserted,
                        failed: 0,
                        error: None,
                    },
                    0,
                )
            }
            Err(e) => {
                let reason = e.to_string();
                // Replays reuse the same stored credentials.
                let unrecoverable = matches!(e, ConnectorError::Credentials(_));
                tracing::warn!(
                    plugin_id,
                    table,
                    rows = row_count,
                    unrecoverable,
                    error = %reason,
                    "Table insert rolled back, dead-lettering rows"
                );

                let mut dead_lettered = 0;
                for row in groups.iter().flatten() {
                    let pushed = if unrecoverable {
                        self.dead_letters
                            .push_exhausted(plugin_id, table, row.clone(), &reason)
                            .await
                    } else {
                        self.dead_letters
                            .push(plugin_id, table, row.clone(), &reason)
                            .await
                    };
                    match pushed {
                        Ok(_) => dead_lettered += 1,
                        Err(store_err) => tracing::error!(
                            plugin_id,
                            table,
                            error = %store_err,
                            "Failed to dead-letter row; row is lost"
                        ),
                    }
                }

                (
                    TableOutcome {
                        table: table.to_string(),
                        inserted: 0,
                        failed: row_count,
                        error: Some(reason),
                    },
                    dead_lettered,
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Assign extracted values to declared fields, one list per plugin table in
/// declaration order.
///
/// `"table.column"` keys go to that table; bare keys go to the first table.
/// A qualified key beats a bare key for the same column. Unknown tables and
/// undeclared columns are ignored.
fn route_fields<'a>(
    plugin: &'a Plugin,
    fields: &'a ExtractedFields,
) -> Vec<Vec<(&'a PluginField, &'a str)>> {
    let mut bare: HashMap<&str, &str> = HashMap::new();
    let mut qualified: Vec<HashMap<&str, &str>> = vec![HashMap::new(); plugin.tables.len()];

    for (key, value) in fields {
        match key.rsplit_once('.') {
            Some((prefix, column)) => {
                match plugin.tables.iter().position(|t| t.table_name == prefix) {
                    Some(idx) => {
                        qualified[idx].insert(column, value.as_str());
                    }
                    None => tracing::debug!(
                        plugin_id = plugin.id,
                        table = prefix,
                        "Ignoring field for undeclared table"
                    ),
                }
            }
            None => {
                bare.insert(key.as_str(), value.as_str());
            }
        }
    }

    plugin
        .tables
        .iter()
        .enumerate()
        .map(|(idx, table)| {
            let lookup = |column: &str| {
                qualified[idx]
                    .get(column)
                    .or_else(|| if idx == 0 { bare.get(column) } else { None })
                    .copied()
            };
            declared_values(table, lookup)
        })
        .collect()
}

fn declared_values<'a>(
    table: &'a PluginTable,
    lookup: impl Fn(&str) -> Option<&'a str>,
) -> Vec<(&'a PluginField, &'a str)> {
    let mut seen = Vec::new();
    table
        .fields
        .iter()
        .filter(|field| {
            // Duplicated declarations bind the value once.
            if seen.contains(&field.column_name.as_str()) {
                return false;
            }
            seen.push(field.column_name.as_str());
            true
        })
        .filter_map(|field| lookup(&field.column_name).map(|value| (field, value)))
        .collect()
}

/// Split rows into runs with identical column sets, keeping first-seen
/// order, since one multi-row INSERT needs the same columns in every row.
fn group_by_columns(rows: Vec<RowValues>) -> Vec<Vec<RowValues>> {
    let mut groups: Vec<(Vec<String>, Vec<RowValues>)> = Vec::new();
    for row in rows {
        let columns: Vec<String> = row.keys().cloned().collect();
        match groups.iter_mut().find(|(cols, _)| *cols == columns) {
            Some((_, group)) => group.push(row),
            None => groups.push((columns, vec![row])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}
