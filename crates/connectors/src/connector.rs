//! The dialect-independent connector interface.

use std::time::Duration;

use async_trait::async_trait;
use formflow_core::plugin::DatabaseType;
use formflow_core::schema::TableInfo;
use formflow_core::types::DbId;
use formflow_core::value::RowValues;
use futures::future::BoxFuture;

use crate::error::ConnectorError;

/// Pooled access to one plugin's external database.
///
/// Implementations create their pool lazily on first use, so constructing
/// a connector never touches the network.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    fn plugin_id(&self) -> DbId;

    fn database_type(&self) -> DatabaseType;

    /// Establish the pool if it does not exist yet.
    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Close the pool. Idempotent; a later call reconnects lazily.
    async fn disconnect(&self);

    /// `SELECT 1` against the database. Never errors; failures are logged.
    async fn test_connection(&self) -> bool;

    /// Live column layout of `table`, or `None` if it does not exist.
    async fn get_table_schema(&self, table: &str) -> Result<Option<TableInfo>, ConnectorError>;

    /// Insert all `rows` in one statement. Returns rows affected.
    async fn execute_insert_many(
        &self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError>;

    /// Insert one row, returning the generated id when the dialect reports one.
    async fn execute_insert(
        &self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError>;

    /// Start a transaction holding one pooled connection until it ends.
    async fn begin(&self) -> Result<Box<dyn ConnectorTransaction>, ConnectorError>;
}

/// A transaction on one physical connection.
///
/// Dropping it without calling [`commit`](Self::commit) rolls back.
#[async_trait]
pub trait ConnectorTransaction: Send {
    async fn execute_insert_many(
        &mut self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError>;

    async fn execute_insert(
        &mut self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError>;

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError>;

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError>;
}

/// Run `body` inside a transaction on `connector`.
///
/// Commits when `body` returns `Ok`, rolls back when it returns `Err`. With
/// a `timeout`, a body that overruns is dropped, the transaction rolled
/// back, and [`ConnectorError::Timeout`] returned.
pub async fn run_in_transaction<C, T, F>(
    connector: &C,
    timeout: Option<Duration>,
    body: F,
) -> Result<T, ConnectorError>
where
    C: DatabaseConnector + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn ConnectorTransaction) -> BoxFuture<'t, Result<T, ConnectorError>>
        + Send,
{
    let mut tx = connector.begin().await?;

    let outcome = {
        let work = body(tx.as_mut());
        match timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(ConnectorError::Timeout(limit))),
            None => work.await,
        }
    };

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(
                    plugin_id = connector.plugin_id(),
                    error = %rollback_err,
                    "Rollback failed after transaction error"
                );
            }
            Err(e)
        }
    }
}
