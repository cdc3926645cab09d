//! Per-plugin connector cache.
//!
//! [`ConnectorFactory`] hands out one [`GuardedConnector`] per plugin and
//! keeps it (and therefore its pool) alive across calls. Connectors are
//! rebuilt when a plugin's stored credentials or dialect change, and closed
//! explicitly on plugin deletion or shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use formflow_core::encryption::EncryptionService;
use formflow_core::plugin::{plugin_breaker_key, DatabaseType, Plugin};
use formflow_core::resilience::{CircuitBreaker, CircuitBreakerRegistry};
use formflow_core::types::DbId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::connector::DatabaseConnector;
use crate::guarded::GuardedConnector;
use crate::mysql::MySqlConnector;
use crate::postgres::PostgresConnector;

/// Plugin id used for throwaway connectors that check a configuration
/// before the plugin is saved or activated.
pub const VALIDATION_PLUGIN_ID: DbId = -1;

// ---------------------------------------------------------------------------
// Builder seam
// ---------------------------------------------------------------------------

/// Turns stored plugin settings into an unguarded connector.
pub trait ConnectorBuilder: Send + Sync {
    fn build(
        &self,
        plugin_id: DbId,
        db_type: DatabaseType,
        encrypted_config: &str,
    ) -> Arc<dyn DatabaseConnector>;
}

/// Production builder backed by sqlx pools.
#[derive(Debug, Clone)]
pub struct SqlxConnectorBuilder {
    encryption: Arc<EncryptionService>,
}

impl SqlxConnectorBuilder {
    pub fn new(encryption: Arc<EncryptionService>) -> Self {
        Self { encryption }
    }
}

impl ConnectorBuilder for SqlxConnectorBuilder {
    fn build(
        &self,
        plugin_id: DbId,
        db_type: DatabaseType,
        encrypted_config: &str,
    ) -> Arc<dyn DatabaseConnector> {
        match db_type {
            DatabaseType::Postgres => Arc::new(PostgresConnector::new(
                plugin_id,
                encrypted_config.to_string(),
                Arc::clone(&self.encryption),
            )),
            DatabaseType::MySql => Arc::new(MySqlConnector::new(
                plugin_id,
                encrypted_config.to_string(),
                Arc::clone(&self.encryption),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

struct CachedConnector {
    db_type: DatabaseType,
    encrypted_config: String,
    connector: Arc<GuardedConnector>,
}

/// Diagnostic view of the factory cache.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryStats {
    pub cached_plugins: Vec<DbId>,
}

pub struct ConnectorFactory {
    builder: Arc<dyn ConnectorBuilder>,
    breakers: Arc<CircuitBreakerRegistry>,
    connectors: RwLock<HashMap<DbId, CachedConnector>>,
}

impl ConnectorFactory {
    pub fn new(builder: Arc<dyn ConnectorBuilder>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            builder,
            breakers,
            connectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Cached connector for a plugin, creating it if needed.
    ///
    /// The pool itself is opened lazily by the first query.
    pub async fn get_connector(
        &self,
        plugin_id: DbId,
        db_type: DatabaseType,
        encrypted_config: &str,
    ) -> Arc<GuardedConnector> {
        if let Some(cached) = self.connectors.read().await.get(&plugin_id) {
            if cached.db_type == db_type && cached.encrypted_config == encrypted_config {
                return Arc::clone(&cached.connector);
            }
        }

        let mut connectors = self.connectors.write().await;
        if let Some(cached) = connectors.get(&plugin_id) {
            if cached.db_type == db_type && cached.encrypted_config == encrypted_config {
                return Arc::clone(&cached.connector);
            }
        }

        let stale = connectors.remove(&plugin_id);

        let breaker = self.breakers.get(&plugin_breaker_key(plugin_id)).await;
        let inner = self.builder.build(plugin_id, db_type, encrypted_config);
        let connector = Arc::new(GuardedConnector::new(inner, breaker));

        connectors.insert(
            plugin_id,
            CachedConnector {
                db_type,
                encrypted_config: encrypted_config.to_string(),
                connector: Arc::clone(&connector),
            },
        );
        drop(connectors);
        tracing::debug!(plugin_id, database_type = %db_type, "Connector created");

        // Closing a pool waits for checked-out connections, so it must not
        // hold up lookups for other plugins.
        if let Some(stale) = stale {
            tracing::info!(plugin_id, "Plugin connection settings changed, old connector closed");
            stale.connector.disconnect().await;
        }
        connector
    }

    /// Shorthand for [`get_connector`](Self::get_connector) with a plugin's
    /// stored settings.
    pub async fn for_plugin(&self, plugin: &Plugin) -> Arc<GuardedConnector> {
        self.get_connector(
            plugin.id,
            plugin.database_type,
            &plugin.connection_config_encrypted,
        )
        .await
    }

    /// An uncached connector under [`VALIDATION_PLUGIN_ID`] with its own
    /// breaker, so checking one configuration never disturbs another or a
    /// live plugin. Callers must [`disconnect`](DatabaseConnector::disconnect)
    /// it when done.
    pub fn validation_connector(
        &self,
        db_type: DatabaseType,
        encrypted_config: &str,
    ) -> GuardedConnector {
        let inner = self
            .builder
            .build(VALIDATION_PLUGIN_ID, db_type, encrypted_config);
        let breaker = Arc::new(CircuitBreaker::new(
            plugin_breaker_key(VALIDATION_PLUGIN_ID),
            self.breakers.settings().clone(),
        ));
        GuardedConnector::new(inner, breaker)
    }

    /// Close and forget a plugin's connector. Returns `false` if none was
    /// cached.
    pub async fn close_connector(&self, plugin_id: DbId) -> bool {
        let removed = self.connectors.write().await.remove(&plugin_id);
        match removed {
            Some(cached) => {
                cached.connector.disconnect().await;
                tracing::info!(plugin_id, "Connector closed");
                true
            }
            None => false,
        }
    }

    /// Close every cached connector. Used at shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(DbId, CachedConnector)> =
            self.connectors.write().await.drain().collect();
        let count = drained.len();
        for (_, cached) in drained {
            cached.connector.disconnect().await;
        }
        tracing::info!(count, "All connectors closed");
    }

    pub async fn stats(&self) -> FactoryStats {
        let mut cached_plugins: Vec<DbId> =
            self.connectors.read().await.keys().copied().collect();
        cached_plugins.sort_unstable();
        FactoryStats { cached_plugins }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use formflow_core::resilience::{BreakerSettings, CircuitState};
    use formflow_core::value::{RowValues, SqlValue};

    use super::*;
    use crate::mock::{MockConnectorBuilder, MockDatabase};

    fn factory(builder: Arc<MockConnectorBuilder>) -> ConnectorFactory {
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            ..Default::default()
        }));
        ConnectorFactory::new(builder, breakers)
    }

    #[tokio::test]
    async fn reuses_connector_per_plugin() {
        let builder = MockConnectorBuilder::new();
        let factory = factory(Arc::clone(&builder));

        let a = factory.get_connector(1, DatabaseType::Postgres, "cfg-1").await;
        let b = factory.get_connector(1, DatabaseType::Postgres, "cfg-1").await;
        let c = factory.get_connector(2, DatabaseType::MySql, "cfg-2").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(builder.builds(), vec![1, 2]);
        assert_eq!(factory.stats().await.cached_plugins, vec![1, 2]);
    }

    #[tokio::test]
    async fn rebuilds_when_credentials_change() {
        let builder = MockConnectorBuilder::new();
        let factory = factory(Arc::clone(&builder));

        let old = factory.get_connector(1, DatabaseType::Postgres, "cfg-old").await;
        let new = factory.get_connector(1, DatabaseType::Postgres, "cfg-new").await;

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(builder.builds(), vec![1, 1]);
        assert_eq!(factory.stats().await.cached_plugins, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_does_not_block_other_plugins() {
        let builder = MockConnectorBuilder::new();
        let draining = MockDatabase::new();
        draining.set_disconnect_delay(Duration::from_secs(2));
        builder.register("cfg-old", draining);
        let factory = Arc::new(factory(Arc::clone(&builder)));

        factory.get_connector(1, DatabaseType::Postgres, "cfg-old").await;
        let other = factory.get_connector(2, DatabaseType::MySql, "cfg-2").await;

        let rebuild = tokio::spawn({
            let factory = Arc::clone(&factory);
            async move { factory.get_connector(1, DatabaseType::Postgres, "cfg-new").await }
        });
        while builder.builds().len() < 3 {
            tokio::task::yield_now().await;
        }

        let lookup = tokio::time::timeout(
            Duration::from_millis(100),
            factory.get_connector(2, DatabaseType::MySql, "cfg-2"),
        )
        .await
        .expect("lookup waited on another plugin's disconnect");
        assert!(Arc::ptr_eq(&lookup, &other));
        assert!(!rebuild.is_finished());

        let rebuilt = rebuild.await.unwrap();
        assert!(Arc::ptr_eq(
            &rebuilt,
            &factory.get_connector(1, DatabaseType::Postgres, "cfg-new").await
        ));
    }

    #[tokio::test]
    async fn one_dead_plugin_does_not_affect_another() {
        let builder = MockConnectorBuilder::new();
        builder.register(
            "healthy",
            MockDatabase::new().with_table("leads", &[("email", "text", false)]),
        );
        let factory = factory(Arc::clone(&builder));

        let dead = factory.get_connector(1, DatabaseType::Postgres, "unregistered").await;
        let healthy = factory.get_connector(2, DatabaseType::Postgres, "healthy").await;

        assert!(dead.get_table_schema("leads").await.is_err());
        assert_eq!(dead.breaker().state(), CircuitState::Open);

        let mut row = RowValues::new();
        row.insert("email".into(), SqlValue::Text("a@x.io".into()));
        assert!(healthy.execute_insert("leads", &row).await.is_ok());
        assert_eq!(healthy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn close_connector_forgets_plugin() {
        let factory = factory(MockConnectorBuilder::new());
        factory.get_connector(7, DatabaseType::MySql, "cfg").await;

        assert!(factory.close_connector(7).await);
        assert!(!factory.close_connector(7).await);
        assert!(factory.stats().await.cached_plugins.is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_cache() {
        let factory = factory(MockConnectorBuilder::new());
        for id in 1..=3 {
            factory.get_connector(id, DatabaseType::Postgres, "cfg").await;
        }
        factory.close_all().await;
        assert!(factory.stats().await.cached_plugins.is_empty());
    }

    #[tokio::test]
    async fn validation_connectors_are_never_cached() {
        let builder = MockConnectorBuilder::new();
        let factory = factory(Arc::clone(&builder));

        let connector = factory.validation_connector(DatabaseType::Postgres, "cfg");
        assert_eq!(connector.plugin_id(), VALIDATION_PLUGIN_ID);
        assert!(!connector.test_connection().await);

        assert_eq!(builder.builds(), vec![VALIDATION_PLUGIN_ID]);
        assert!(factory.stats().await.cached_plugins.is_empty());
        assert!(factory.breakers().snapshot().await.is_empty());
    }
}
