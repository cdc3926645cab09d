mod config;

use std::sync::Arc;

use anyhow::Context;
use formflow_connectors::{ConnectorFactory, SqlxConnectorBuilder};
use formflow_core::encryption::EncryptionService;
use formflow_core::resilience::CircuitBreakerRegistry;
use formflow_db::{PgDeadLetterStore, PgPluginSource};
use formflow_events::WebhookService;
use formflow_pipeline::{DeadLetterQueue, RetryScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, WorkerConfig};

const DEFAULT_LOG_FILTER: &str =
    "formflow_worker=debug,formflow_pipeline=debug,formflow_connectors=info,formflow_events=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_format);
    tracing::info!(?config, "Worker starting");

    let pool = formflow_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to the FormFlow database")?;
    formflow_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Database ready");

    let encryption = Arc::new(EncryptionService::new(&config.secret_key)?);
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let factory = Arc::new(ConnectorFactory::new(
        Arc::new(SqlxConnectorBuilder::new(encryption)),
        Arc::clone(&breakers),
    ));
    let webhooks = Arc::new(WebhookService::new(
        Arc::clone(&breakers),
        config.webhook.clone(),
    )?);
    let queue = Arc::new(DeadLetterQueue::new(
        Arc::new(PgDeadLetterStore::new(pool.clone())),
        config.dead_letter.clone(),
    ));

    let scheduler = RetryScheduler::new(
        queue,
        Arc::clone(&factory),
        Arc::new(PgPluginSource::new(pool.clone())),
        webhooks,
        config.scheduler.clone(),
    );

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Retry scheduler task panicked");
    }
    factory.close_all().await;
    pool.close().await;

    tracing::info!("Worker stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
