//! Wiring shared by the pipeline integration tests: the real factory,
//! queue and webhook service over in-memory databases and stores.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use formflow_connectors::mock::{MockConnectorBuilder, MockDatabase};
use formflow_connectors::ConnectorFactory;
use formflow_core::dead_letter::{DeadLetterPolicy, MemoryDeadLetterStore};
use formflow_core::error::CoreError;
use formflow_core::plugin::{
    ColumnType, DatabaseType, ExtractedFields, Plugin, PluginField, PluginSource, PluginTable,
    WebhookConfig,
};
use formflow_core::resilience::{BreakerSettings, CircuitBreakerRegistry};
use formflow_core::types::DbId;
use formflow_events::{WebhookService, WebhookSettings};
use formflow_pipeline::{DeadLetterQueue, PopulationService, PopulationSettings};
use wiremock::{MockServer, Request};

pub const LEADS_CONFIG: &str = "cfg-leads";
pub const WEBHOOK_SECRET: &str = "whsec_pipeline";

pub struct Harness {
    pub builder: Arc<MockConnectorBuilder>,
    pub factory: Arc<ConnectorFactory>,
    pub store: Arc<MemoryDeadLetterStore>,
    pub queue: Arc<DeadLetterQueue>,
    pub webhooks: Arc<WebhookService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(BreakerSettings::default(), DeadLetterPolicy::default())
    }

    pub fn with(breaker: BreakerSettings, policy: DeadLetterPolicy) -> Self {
        let builder = MockConnectorBuilder::new();
        let factory = Arc::new(ConnectorFactory::new(
            builder.clone(),
            Arc::new(CircuitBreakerRegistry::new(breaker.clone())),
        ));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let queue = Arc::new(DeadLetterQueue::new(store.clone(), policy));
        let webhooks = Arc::new(
            WebhookService::new(
                Arc::new(CircuitBreakerRegistry::new(breaker)),
                WebhookSettings {
                    timeout: Duration::from_secs(2),
                    default_max_retries: 1,
                    initial_backoff: Duration::from_millis(5),
                },
            )
            .unwrap(),
        );
        Self {
            builder,
            factory,
            store,
            queue,
            webhooks,
        }
    }

    pub fn population(&self) -> PopulationService {
        self.population_with(PopulationSettings::default())
    }

    pub fn population_with(&self, settings: PopulationSettings) -> PopulationService {
        PopulationService::new(
            self.factory.clone(),
            self.queue.clone(),
            self.webhooks.clone(),
            settings,
        )
    }
}

/// A database with a `leads(id, name, email, age)` and a `notes(id, body)`
/// table.
pub fn crm_database() -> Arc<MockDatabase> {
    MockDatabase::new()
        .with_table(
            "leads",
            &[
                ("id", "int4", false),
                ("name", "text", true),
                ("email", "character varying", true),
                ("age", "int4", true),
            ],
        )
        .with_table("notes", &[("id", "int4", false), ("body", "text", true)])
}

pub fn leads_table() -> PluginTable {
    PluginTable::new(
        "leads",
        vec![
            PluginField::new("name", ColumnType::String),
            PluginField::new("email", ColumnType::String),
        ],
    )
}

pub fn plugin(id: DbId, tables: Vec<PluginTable>) -> Plugin {
    Plugin {
        id,
        user_id: 1,
        name: format!("CRM {id}"),
        database_type: DatabaseType::Postgres,
        connection_config_encrypted: LEADS_CONFIG.into(),
        tables,
        webhooks: Vec::new(),
        is_active: true,
        updated_at: None,
    }
}

pub fn with_webhook(mut plugin: Plugin, server: &MockServer) -> Plugin {
    plugin.webhooks.push(WebhookConfig::new(
        format!("{}/hooks/formflow", server.uri()),
        WEBHOOK_SECRET,
    ));
    plugin
}

pub fn fields(pairs: &[(&str, &str)]) -> ExtractedFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Poll until `server` has seen at least `count` requests. Background
/// deliveries land some time after the call that queued them returns.
pub async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<Request> {
    for _ in 0..200 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} webhook request(s)");
}

pub fn body(request: &Request) -> serde_json::Value {
    serde_json::from_slice(&request.body).unwrap()
}

/// Fixed plugin lookup for the retry scheduler.
#[derive(Default)]
pub struct StaticPlugins {
    plugins: Mutex<HashMap<DbId, Plugin>>,
    failing: Mutex<bool>,
}

impl StaticPlugins {
    pub fn new(plugins: impl IntoIterator<Item = Plugin>) -> Arc<Self> {
        let source = Self::default();
        source
            .plugins
            .lock()
            .unwrap()
            .extend(plugins.into_iter().map(|p| (p.id, p)));
        Arc::new(source)
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl PluginSource for StaticPlugins {
    async fn find_plugin(&self, plugin_id: DbId) -> Result<Option<Plugin>, CoreError> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::Internal("plugin store unavailable".into()));
        }
        Ok(self.plugins.lock().unwrap().get(&plugin_id).cloned())
    }
}
