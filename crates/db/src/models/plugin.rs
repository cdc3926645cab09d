use formflow_core::plugin::{DatabaseType, Plugin, PluginTable, WebhookConfig};
use formflow_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `plugins` table.
///
/// `tables` and `webhooks` are JSONB arrays written by the configuration API.
#[derive(Debug, Clone, FromRow)]
pub struct PluginRow {
    pub id: DbId,
    pub user_id: DbId,
    pub name: String,
    pub database_type: String,
    pub connection_config_encrypted: String,
    pub tables: serde_json::Value,
    pub webhooks: serde_json::Value,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<PluginRow> for Plugin {
    type Error = String;

    fn try_from(row: PluginRow) -> Result<Self, Self::Error> {
        let database_type: DatabaseType = row.database_type.parse()?;
        let tables: Vec<PluginTable> = serde_json::from_value(row.tables)
            .map_err(|e| format!("Plugin {} has invalid table declarations: {e}", row.id))?;
        let webhooks: Vec<WebhookConfig> = serde_json::from_value(row.webhooks)
            .map_err(|e| format!("Plugin {} has invalid webhook configs: {e}", row.id))?;

        Ok(Plugin {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            database_type,
            connection_config_encrypted: row.connection_config_encrypted,
            tables,
            webhooks,
            is_active: row.is_active,
            updated_at: Some(row.updated_at),
        })
    }
}
