//! MySQL connector.

use std::sync::Arc;

use async_trait::async_trait;
use formflow_core::connection::ConnectionConfig;
use formflow_core::encryption::EncryptionService;
use formflow_core::plugin::DatabaseType;
use formflow_core::schema::{ColumnInfo, TableInfo};
use formflow_core::types::DbId;
use formflow_core::value::{RowValues, SqlValue};
use sqlx::mysql::{
    MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlQueryResult, MySqlSslMode,
};
use sqlx::query::Query;
use sqlx::{MySql, MySqlPool, Row};
use tokio::sync::RwLock;

use crate::connector::{ConnectorTransaction, DatabaseConnector};
use crate::credentials::decrypt_config;
use crate::error::ConnectorError;
use crate::sql::{build_insert, split_table_name, Statement};

// information_schema columns are utf8 with binary-ish collations on some
// servers; casting keeps them decodable as `String`/`i64`.
const INTROSPECT_COLUMNS: &str = "\
    SELECT CAST(COLUMN_NAME AS CHAR) AS column_name, \
           CAST(DATA_TYPE AS CHAR) AS data_type, \
           CAST(IS_NULLABLE = 'YES' AS SIGNED) AS is_nullable, \
           CAST(COLUMN_KEY = 'PRI' AS SIGNED) AS is_primary_key, \
           CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS max_length \
    FROM information_schema.COLUMNS \
    WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
    ORDER BY ORDINAL_POSITION";

/// Connector for a plugin whose database is MySQL or MariaDB.
pub struct MySqlConnector {
    plugin_id: DbId,
    encrypted_config: String,
    encryption: Arc<EncryptionService>,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlConnector {
    pub fn new(plugin_id: DbId, encrypted_config: String, encryption: Arc<EncryptionService>) -> Self {
        Self {
            plugin_id,
            encrypted_config,
            encryption,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool, ConnectorError> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let config = decrypt_config(&self.encryption, &self.encrypted_config)?;
        let pool = open_pool(self.plugin_id, &config).await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

async fn open_pool(plugin_id: DbId, config: &ConnectionConfig) -> Result<MySqlPool, ConnectorError> {
    let ssl_mode = match (config.ssl, config.ssl_verify) {
        (true, true) => MySqlSslMode::VerifyIdentity,
        (true, false) => MySqlSslMode::Required,
        (false, _) => MySqlSslMode::Preferred,
    };

    let options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port_for(DatabaseType::MySql))
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode)
        .charset("utf8mb4");

    let pool = tokio::time::timeout(
        config.connect_timeout(),
        MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.pool_timeout())
            .max_lifetime(config.pool_recycle())
            .idle_timeout(config.pool_recycle())
            .connect_with(options),
    )
    .await
    .map_err(|_| ConnectorError::Timeout(config.connect_timeout()))??;

    tracing::info!(
        plugin_id,
        host = %config.host,
        database = %config.database,
        pool_size = config.pool_size,
        "MySQL pool created"
    );
    Ok(pool)
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Boolean(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        // MySQL has no native UUID type; plugin columns are CHAR(36).
        SqlValue::Uuid(v) => query.bind(v.to_string()),
    }
}

fn bind_all<'q>(stmt: &'q Statement) -> Query<'q, MySql, MySqlArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), |query, value| bind_value(query, value))
}

fn last_insert_id(result: &MySqlQueryResult) -> Option<i64> {
    match result.last_insert_id() {
        0 => None,
        id => i64::try_from(id).ok(),
    }
}

fn flag(row: &sqlx::mysql::MySqlRow, column: &str) -> Result<bool, sqlx::Error> {
    Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or(0) != 0)
}

#[async_trait]
impl DatabaseConnector for MySqlConnector {
    fn plugin_id(&self) -> DbId {
        self.plugin_id
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.pool().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!(plugin_id = self.plugin_id, "MySQL pool closed");
        }
    }

    async fn test_connection(&self) -> bool {
        let result = async {
            let pool = self.pool().await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok::<_, ConnectorError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(plugin_id = self.plugin_id, error = %e, "Connection test failed");
                false
            }
        }
    }

    async fn get_table_schema(&self, table: &str) -> Result<Option<TableInfo>, ConnectorError> {
        let (schema, table_name) = split_table_name(table)?;
        let pool = self.pool().await?;

        let rows = sqlx::query(INTROSPECT_COLUMNS)
            .bind(schema)
            .bind(table_name)
            .fetch_all(&pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                    is_nullable: flag(row, "is_nullable")?,
                    is_primary_key: flag(row, "is_primary_key")?,
                    max_length: row.try_get("max_length")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(TableInfo {
            name: table.to_string(),
            columns,
        }))
    }

    async fn execute_insert_many(
        &self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let stmt = build_insert(DatabaseType::MySql, table, rows, None)?;
        let pool = self.pool().await?;
        let result = bind_all(&stmt).execute(&pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute_insert(
        &self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        let stmt = build_insert(DatabaseType::MySql, table, std::slice::from_ref(row), None)?;
        let pool = self.pool().await?;
        let result = bind_all(&stmt).execute(&pool).await?;
        Ok(last_insert_id(&result))
    }

    async fn begin(&self) -> Result<Box<dyn ConnectorTransaction>, ConnectorError> {
        let pool = self.pool().await?;
        let tx = pool.begin().await?;
        Ok(Box::new(MySqlTransaction { tx }))
    }
}

struct MySqlTransaction {
    tx: sqlx::Transaction<'static, MySql>,
}

#[async_trait]
impl ConnectorTransaction for MySqlTransaction {
    async fn execute_insert_many(
        &mut self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let stmt = build_insert(DatabaseType::MySql, table, rows, None)?;
        let result = bind_all(&stmt).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn execute_insert(
        &mut self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        let stmt = build_insert(DatabaseType::MySql, table, std::slice::from_ref(row), None)?;
        let result = bind_all(&stmt).execute(&mut *self.tx).await?;
        Ok(last_insert_id(&result))
    }

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
