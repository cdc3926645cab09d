//! Circuit-breaker wrapper around a connector.

use std::sync::Arc;

use async_trait::async_trait;
use formflow_core::plugin::DatabaseType;
use formflow_core::resilience::{call_guarded, record_error, CircuitBreaker, ResilienceError};
use formflow_core::schema::TableInfo;
use formflow_core::types::DbId;
use formflow_core::value::RowValues;

use crate::connector::{ConnectorTransaction, DatabaseConnector};
use crate::error::ConnectorError;

/// A connector whose every call passes through the plugin's breaker.
///
/// While the breaker is open calls fail immediately with
/// [`ConnectorError::CircuitOpen`] instead of waiting out a connect timeout
/// against a host already known to be down.
pub struct GuardedConnector {
    inner: Arc<dyn DatabaseConnector>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedConnector {
    pub fn new(inner: Arc<dyn DatabaseConnector>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl DatabaseConnector for GuardedConnector {
    fn plugin_id(&self) -> DbId {
        self.inner.plugin_id()
    }

    fn database_type(&self) -> DatabaseType {
        self.inner.database_type()
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        call_guarded(&self.breaker, self.inner.connect()).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    async fn test_connection(&self) -> bool {
        let Ok(admission) = self.breaker.try_acquire() else {
            tracing::debug!(
                plugin_id = self.plugin_id(),
                breaker = %self.breaker.key(),
                "Connection test short-circuited by open breaker"
            );
            return false;
        };

        // Settings that cannot be read never reach the host.
        if let Err(e) = self.inner.connect().await {
            tracing::warn!(plugin_id = self.plugin_id(), error = %e, "Connection test failed");
            record_error(&self.breaker, admission, &e);
            return false;
        }

        let ok = self.inner.test_connection().await;
        if ok {
            self.breaker.record_success(admission);
        } else {
            self.breaker.record_failure();
        }
        ok
    }

    async fn get_table_schema(&self, table: &str) -> Result<Option<TableInfo>, ConnectorError> {
        call_guarded(&self.breaker, self.inner.get_table_schema(table)).await
    }

    async fn execute_insert_many(
        &self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        call_guarded(&self.breaker, self.inner.execute_insert_many(table, rows)).await
    }

    async fn execute_insert(
        &self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        call_guarded(&self.breaker, self.inner.execute_insert(table, row)).await
    }

    async fn begin(&self) -> Result<Box<dyn ConnectorTransaction>, ConnectorError> {
        let inner = call_guarded(&self.breaker, self.inner.begin()).await?;
        Ok(Box::new(GuardedTransaction {
            inner,
            breaker: Arc::clone(&self.breaker),
        }))
    }
}

/// Transaction whose connection failures still count against the breaker.
///
/// Statements inside an admitted transaction are not re-checked against the
/// breaker; only their outcome is recorded.
struct GuardedTransaction {
    inner: Box<dyn ConnectorTransaction>,
    breaker: Arc<CircuitBreaker>,
}

fn observe<T>(
    breaker: &CircuitBreaker,
    result: Result<T, ConnectorError>,
) -> Result<T, ConnectorError> {
    if let Err(e) = &result {
        if e.trips_breaker() {
            breaker.record_failure();
        }
    }
    result
}

#[async_trait]
impl ConnectorTransaction for GuardedTransaction {
    async fn execute_insert_many(
        &mut self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        let result = self.inner.execute_insert_many(table, rows).await;
        observe(&self.breaker, result)
    }

    async fn execute_insert(
        &mut self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        let result = self.inner.execute_insert(table, row).await;
        observe(&self.breaker, result)
    }

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError> {
        let GuardedTransaction { inner, breaker } = *self;
        observe(&breaker, inner.commit().await)
    }

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError> {
        self.inner.rollback().await
    }
}
