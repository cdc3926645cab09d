//! Read-only access to the `plugins` table.
//!
//! Plugins are written by the configuration API; the worker only needs to
//! look them up when replaying dead-letter entries.

use formflow_core::types::DbId;
use sqlx::PgPool;

use crate::models::plugin::PluginRow;

const COLUMNS: &str = "\
    id, user_id, name, database_type, connection_config_encrypted, \
    tables, webhooks, is_active, created_at, updated_at";

pub struct PluginRepo;

impl PluginRepo {
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<PluginRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM plugins WHERE id = $1");
        sqlx::query_as::<_, PluginRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
