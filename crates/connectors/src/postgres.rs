//! PostgreSQL connector.

use std::sync::Arc;

use async_trait::async_trait;
use formflow_core::connection::ConnectionConfig;
use formflow_core::encryption::EncryptionService;
use formflow_core::plugin::DatabaseType;
use formflow_core::schema::{ColumnInfo, TableInfo};
use formflow_core::types::DbId;
use formflow_core::value::{RowValues, SqlValue};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::RwLock;

use crate::connector::{ConnectorTransaction, DatabaseConnector};
use crate::credentials::decrypt_config;
use crate::error::ConnectorError;
use crate::sql::{build_insert, split_table_name, Statement};

const INTROSPECT_COLUMNS: &str = "\
    SELECT c.column_name::text AS column_name, \
           c.udt_name::text AS data_type, \
           (c.is_nullable = 'YES') AS is_nullable, \
           c.character_maximum_length::int8 AS max_length, \
           EXISTS ( \
               SELECT 1 \
               FROM information_schema.table_constraints tc \
               JOIN information_schema.key_column_usage kcu \
                 ON kcu.constraint_name = tc.constraint_name \
                AND kcu.table_schema = tc.table_schema \
                AND kcu.table_name = tc.table_name \
               WHERE tc.constraint_type = 'PRIMARY KEY' \
                 AND tc.table_schema = c.table_schema \
                 AND tc.table_name = c.table_name \
                 AND kcu.column_name = c.column_name \
           ) AS is_primary_key \
    FROM information_schema.columns c \
    WHERE c.table_schema = $1 AND c.table_name = $2 \
    ORDER BY c.ordinal_position";

struct PoolState {
    pool: PgPool,
    default_schema: String,
}

/// Connector for a plugin whose database is PostgreSQL.
pub struct PostgresConnector {
    plugin_id: DbId,
    encrypted_config: String,
    encryption: Arc<EncryptionService>,
    state: RwLock<Option<PoolState>>,
}

impl PostgresConnector {
    pub fn new(plugin_id: DbId, encrypted_config: String, encryption: Arc<EncryptionService>) -> Self {
        Self {
            plugin_id,
            encrypted_config,
            encryption,
            state: RwLock::new(None),
        }
    }

    /// Pool and default schema, creating the pool on first use.
    async fn pool(&self) -> Result<(PgPool, String), ConnectorError> {
        if let Some(state) = self.state.read().await.as_ref() {
            return Ok((state.pool.clone(), state.default_schema.clone()));
        }

        let mut guard = self.state.write().await;
        if let Some(state) = guard.as_ref() {
            return Ok((state.pool.clone(), state.default_schema.clone()));
        }

        let config = decrypt_config(&self.encryption, &self.encrypted_config)?;
        let state = open_pool(self.plugin_id, &config).await?;
        let result = (state.pool.clone(), state.default_schema.clone());
        *guard = Some(state);
        Ok(result)
    }
}

async fn open_pool(plugin_id: DbId, config: &ConnectionConfig) -> Result<PoolState, ConnectorError> {
    let ssl_mode = match (config.ssl, config.ssl_verify) {
        (true, true) => PgSslMode::VerifyFull,
        (true, false) => PgSslMode::Require,
        (false, _) => PgSslMode::Prefer,
    };
    let default_schema = config.schema_or_default().to_string();

    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port_for(DatabaseType::Postgres))
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode)
        .application_name("formflow")
        .options([("search_path", default_schema.as_str())]);

    let pool = tokio::time::timeout(
        config.connect_timeout(),
        PgPoolOptions::new()
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
        "PostgreSQL pool created"
    );

    Ok(PoolState {
        pool,
        default_schema,
    })
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Boolean(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        SqlValue::Uuid(v) => query.bind(*v),
    }
}

fn bind_all<'q>(stmt: &'q Statement) -> Query<'q, Postgres, PgArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), |query, value| bind_value(query, value))
}

/// Generated id of a `RETURNING *` row, if the table has an integer `id`.
fn returned_id(row: &PgRow) -> Option<i64> {
    row.try_get::<i64, _>("id")
        .ok()
        .or_else(|| row.try_get::<i32, _>("id").ok().map(i64::from))
}

fn insert_many_statement(table: &str, rows: &[RowValues]) -> Result<Statement, ConnectorError> {
    build_insert(DatabaseType::Postgres, table, rows, None)
}

fn insert_one_statement(table: &str, row: &RowValues) -> Result<Statement, ConnectorError> {
    build_insert(DatabaseType::Postgres, table, std::slice::from_ref(row), Some("RETURNING *"))
}

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    fn plugin_id(&self) -> DbId {
        self.plugin_id
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.pool().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(state) = self.state.write().await.take() {
            state.pool.close().await;
            tracing::info!(plugin_id = self.plugin_id, "PostgreSQL pool closed");
        }
    }

    async fn test_connection(&self) -> bool {
        let result = async {
            let (pool, _) = self.pool().await?;
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool).await?;
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
        let (pool, default_schema) = self.pool().await?;
        let schema = schema.unwrap_or(&default_schema);

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
                    is_nullable: row.try_get("is_nullable")?,
                    is_primary_key: row.try_get("is_primary_key")?,
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
        let stmt = insert_many_statement(table, rows)?;
        let (pool, _) = self.pool().await?;
        let result = bind_all(&stmt).execute(&pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute_insert(
        &self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        let stmt = insert_one_statement(table, row)?;
        let (pool, _) = self.pool().await?;
        let returned = bind_all(&stmt).fetch_one(&pool).await?;
        Ok(returned_id(&returned))
    }

    async fn begin(&self) -> Result<Box<dyn ConnectorTransaction>, ConnectorError> {
        let (pool, _) = self.pool().await?;
        let tx = pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl ConnectorTransaction for PostgresTransaction {
    async fn execute_insert_many(
        &mut self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let stmt = insert_many_statement(table, rows)?;
        let result = bind_all(&stmt).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn execute_insert(
        &mut self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        let stmt = insert_one_statement(table, row)?;
        let returned = bind_all(&stmt).fetch_one(&mut *self.tx).await?;
        Ok(returned_id(&returned))
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
