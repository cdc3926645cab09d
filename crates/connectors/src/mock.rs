//! In-memory connector for tests.
//!
//! A [`MockDatabase`] holds table layouts and committed rows; any number of
//! [`MockConnector`]s can point at it. [`MockConnectorBuilder`] maps a
//! plugin's (opaque) connection string to a database, so tests can drive the
//! real [`ConnectorFactory`](crate::ConnectorFactory) without a server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use formflow_core::encryption::EncryptionError;
use formflow_core::plugin::DatabaseType;
use formflow_core::schema::{ColumnInfo, TableInfo};
use formflow_core::types::DbId;
use formflow_core::value::{RowValues, SqlValue};

use crate::connector::{ConnectorTransaction, DatabaseConnector};
use crate::error::ConnectorError;
use crate::factory::ConnectorBuilder;

#[derive(Debug, Default)]
struct DbState {
    tables: HashMap<String, TableInfo>,
    rows: HashMap<String, Vec<RowValues>>,
    unreachable: bool,
    undecryptable: bool,
    failing_tables: HashMap<String, String>,
    rejected_values: Vec<(String, String, SqlValue)>,
    insert_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
    introspections: usize,
    commits: usize,
    rollbacks: usize,
    next_id: i64,
}

/// A fake external database shared by every connector built for it.
#[derive(Debug, Default)]
pub struct MockDatabase {
    state: Mutex<DbState>,
}

impl MockDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a table. `columns` are `(name, physical type, nullable)`; a
    /// column named `id` is the primary key.
    pub fn with_table(self: Arc<Self>, name: &str, columns: &[(&str, &str, bool)]) -> Arc<Self> {
        let info = TableInfo {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(column, data_type, nullable)| ColumnInfo {
                    name: column.to_string(),
                    data_type: data_type.to_string(),
                    is_nullable: *nullable,
                    is_primary_key: *column == "id",
                    max_length: None,
                })
                .collect(),
        };
        self.lock().tables.insert(name.to_string(), info);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Every call fails as if the stored credentials could not be
    /// decrypted.
    pub fn set_undecryptable(&self, undecryptable: bool) {
        self.lock().undecryptable = undecryptable;
    }

    /// Every insert into `table` fails with a query error.
    pub fn fail_table(&self, table: &str, message: &str) {
        self.lock()
            .failing_tables
            .insert(table.to_string(), message.to_string());
    }

    pub fn heal_table(&self, table: &str) {
        self.lock().failing_tables.remove(table);
    }

    /// Inserts containing `column = value` in `table` fail, like a
    /// constraint violation on that row.
    pub fn reject_value(&self, table: &str, column: &str, value: SqlValue) {
        self.lock()
            .rejected_values
            .push((table.to_string(), column.to_string(), value));
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        self.lock().insert_delay = Some(delay);
    }

    /// Closing a connector takes `delay`, like a pool draining busy
    /// connections.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.lock().disconnect_delay = Some(delay);
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<RowValues> {
        self.lock().rows.get(table).cloned().unwrap_or_default()
    }

    pub fn introspections(&self) -> usize {
        self.lock().introspections
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn check_reachable(&self) -> Result<(), ConnectorError> {
        let state = self.lock();
        if state.undecryptable {
            Err(ConnectorError::Credentials(EncryptionError::Decryption))
        } else if state.unreachable {
            Err(ConnectorError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }

    /// Validate rows against the table as a real server would.
    fn check_rows(&self, table: &str, rows: &[RowValues]) -> Result<(), ConnectorError> {
        let state = self.lock();
        let info = state
            .tables
            .get(table)
            .ok_or_else(|| ConnectorError::Query(format!("relation \"{table}\" does not exist")))?;
        if let Some(message) = state.failing_tables.get(table) {
            return Err(ConnectorError::Query(message.clone()));
        }
        for row in rows {
            for (column, value) in row {
                if !info.has_column(column) {
                    return Err(ConnectorError::Query(format!(
                        "column \"{column}\" of relation \"{table}\" does not exist"
                    )));
                }
                let rejected = state
                    .rejected_values
                    .iter()
                    .any(|(t, c, v)| t == table && c == column && v == value);
                if rejected {
                    return Err(ConnectorError::Query(format!(
                        "duplicate key value violates unique constraint on \"{column}\""
                    )));
                }
            }
        }
        Ok(())
    }

    async fn delay(&self) {
        let delay = self.lock().insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn append(&self, table: &str, rows: Vec<RowValues>) -> Option<i64> {
        let mut state = self.lock();
        let count = rows.len() as i64;
        state.rows.entry(table.to_string()).or_default().extend(rows);
        state.next_id += count;
        Some(state.next_id)
    }
}

/// Connector bound to a [`MockDatabase`].
pub struct MockConnector {
    plugin_id: DbId,
    db_type: DatabaseType,
    db: Arc<MockDatabase>,
}

impl MockConnector {
    pub fn new(plugin_id: DbId, db_type: DatabaseType, db: Arc<MockDatabase>) -> Self {
        Self {
            plugin_id,
            db_type,
            db,
        }
    }
}

#[async_trait]
impl DatabaseConnector for MockConnector {
    fn plugin_id(&self) -> DbId {
        self.plugin_id
    }

    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.db.check_reachable()
    }

    async fn disconnect(&self) {
        let delay = self.db.lock().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn test_connection(&self) -> bool {
        self.db.check_reachable().is_ok()
    }

    async fn get_table_schema(&self, table: &str) -> Result<Option<TableInfo>, ConnectorError> {
        self.db.check_reachable()?;
        let mut state = self.db.lock();
        state.introspections += 1;
        Ok(state.tables.get(table).cloned())
    }

    async fn execute_insert_many(
        &self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        self.db.check_reachable()?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.db.delay().await;
        self.db.check_rows(table, rows)?;
        self.db.append(table, rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn execute_insert(
        &self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        self.db.check_reachable()?;
        self.db.delay().await;
        self.db.check_rows(table, std::slice::from_ref(row))?;
        Ok(self.db.append(table, vec![row.clone()]))
    }

    async fn begin(&self) -> Result<Box<dyn ConnectorTransaction>, ConnectorError> {
        self.db.check_reachable()?;
        Ok(Box::new(MockTransaction {
            db: Arc::clone(&self.db),
            pending: Vec::new(),
        }))
    }
}

struct MockTransaction {
    db: Arc<MockDatabase>,
    pending: Vec<(String, Vec<RowValues>)>,
}

#[async_trait]
impl ConnectorTransaction for MockTransaction {
    async fn execute_insert_many(
        &mut self,
        table: &str,
        rows: &[RowValues],
    ) -> Result<u64, ConnectorError> {
        self.db.check_reachable()?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.db.delay().await;
        self.db.check_rows(table, rows)?;
        self.pending.push((table.to_string(), rows.to_vec()));
        Ok(rows.len() as u64)
    }

    async fn execute_insert(
        &mut self,
        table: &str,
        row: &RowValues,
    ) -> Result<Option<i64>, ConnectorError> {
        self.execute_insert_many(table, std::slice::from_ref(row))
            .await
            .map(|_| None)
    }

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError> {
        let MockTransaction { db, pending } = *self;
        db.check_reachable()?;
        for (table, rows) in pending {
            db.append(&table, rows);
        }
        db.lock().commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError> {
        self.db.lock().rollbacks += 1;
        Ok(())
    }
}

/// Builds [`MockConnector`]s, resolving each plugin's connection string to a
/// registered [`MockDatabase`]. Unknown strings resolve to an unreachable
/// database.
#[derive(Default)]
pub struct MockConnectorBuilder {
    databases: Mutex<HashMap<String, Arc<MockDatabase>>>,
    builds: Mutex<Vec<DbId>>,
}

impl MockConnectorBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, encrypted_config: &str, db: Arc<MockDatabase>) {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(encrypted_config.to_string(), db);
    }

    /// Plugin ids passed to `build`, in call order.
    pub fn builds(&self) -> Vec<DbId> {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConnectorBuilder for MockConnectorBuilder {
    fn build(
        &self,
        plugin_id: DbId,
        db_type: DatabaseType,
        encrypted_config: &str,
    ) -> Arc<dyn DatabaseConnector> {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plugin_id);
        let db = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(encrypted_config)
            .cloned()
            .unwrap_or_else(|| {
                let db = MockDatabase::new();
                db.set_unreachable(true);
                db
            });
        Arc::new(MockConnector::new(plugin_id, db_type, db))
    }
}
