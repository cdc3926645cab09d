//! Background replay of due dead-letter entries.
//!
//! Each cycle releases claims left behind by a crashed worker, claims a batch
//! of due entries and replays each as a single-row insert through the
//! plugin's guarded connector. Resolved entries past their retention are
//! purged once an hour.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use formflow_connectors::{ConnectorError, ConnectorFactory, DatabaseConnector};
use formflow_core::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use formflow_core::error::CoreError;
use formflow_core::plugin::{Plugin, PluginSource};
use formflow_core::types::Timestamp;
use formflow_events::{WebhookEvent, WebhookService};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::DeadLetterQueue;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub scan_interval: Duration,
    /// Entries claimed per cycle.
    pub batch_size: usize,
    /// A `retrying` entry untouched this long belongs to a dead worker.
    pub stale_claim_after: Duration,
    /// How long resolved entries are kept.
    pub resolved_retention: Duration,
    pub purge_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            batch_size: 50,
            stale_claim_after: Duration::from_secs(300),
            resolved_retention: Duration::from_secs(7 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

/// What one scheduler cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub released: u64,
    pub claimed: usize,
    pub resolved: usize,
    /// Failed replays that will be tried again.
    pub rescheduled: usize,
    /// Replays skipped without spending an attempt (open breaker).
    pub deferred: usize,
    pub exhausted: usize,
}

enum Replay {
    Inserted(Option<i64>),
    /// `unrecoverable` when no later attempt can succeed either.
    Failed { reason: String, unrecoverable: bool },
    Blocked(Duration),
}

impl Replay {
    fn failed(reason: String) -> Self {
        Self::Failed {
            reason,
            unrecoverable: false,
        }
    }
}

enum ReplayOutcome {
    Resolved,
    Rescheduled,
    Deferred,
    Exhausted,
}

// ---------------------------------------------------------------------------
// RetryScheduler
// ---------------------------------------------------------------------------

pub struct RetryScheduler {
    queue: Arc<DeadLetterQueue>,
    factory: Arc<ConnectorFactory>,
    plugins: Arc<dyn PluginSource>,
    webhooks: Arc<WebhookService>,
    settings: SchedulerSettings,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<DeadLetterQueue>,
        factory: Arc<ConnectorFactory>,
        plugins: Arc<dyn PluginSource>,
        webhooks: Arc<WebhookService>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            factory,
            plugins,
            webhooks,
            settings,
        }
    }

    /// Run cycles every `scan_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_purge: Option<Instant> = None;

        tracing::info!(
            scan_interval_secs = self.settings.scan_interval.as_secs(),
            batch_size = self.settings.batch_size,
            "Dead-letter retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dead-letter retry scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.claimed > 0 || report.released > 0 => {
                            tracing::info!(
                                released = report.released,
                                claimed = report.claimed,
                                resolved = report.resolved,
                                rescheduled = report.rescheduled,
                                deferred = report.deferred,
                                exhausted = report.exhausted,
                                "Dead-letter cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Dead-letter cycle failed"),
                    }

                    let purge_due = last_purge
                        .map_or(true, |at| at.elapsed() >= self.settings.purge_interval);
                    if purge_due {
                        self.purge(Utc::now()).await;
                        last_purge = Some(Instant::now());
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<CycleReport, CoreError> {
        self.run_once_at(Utc::now()).await
    }

    /// One cycle with `now` as the clock, so callers can replay entries that
    /// are not due yet in wall-clock terms.
    pub async fn run_once_at(&self, now: Timestamp) -> Result<CycleReport, CoreError> {
        let store = self.queue.store();
        let mut report = CycleReport {
            released: store
                .release_stale_claims(now - chrono_duration(self.settings.stale_claim_after))
                .await?,
            ..Default::default()
        };
        if report.released > 0 {
            tracing::warn!(released = report.released, "Released stale dead-letter claims");
        }

        let claimed = store.claim_due(now, self.settings.batch_size).await?;
        report.claimed = claimed.len();

        for entry in claimed {
            let entry_id = entry.id;
            match self.replay(entry, now).await {
                Ok(ReplayOutcome::Resolved) => report.resolved += 1,
                Ok(ReplayOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(ReplayOutcome::Deferred) => report.deferred += 1,
                Ok(ReplayOutcome::Exhausted) => report.exhausted += 1,
                // The claim expires and the entry is released next time.
                Err(e) => tracing::error!(entry_id, error = %e, "Failed to save dead-letter entry"),
            }
        }

        Ok(report)
    }

    /// Purge resolved entries older than the retention period.
    pub async fn purge(&self, now: Timestamp) -> u64 {
        let cutoff = now - chrono_duration(self.settings.resolved_retention);
        match self.queue.store().purge_resolved(cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    tracing::info!(purged, "Purged resolved dead-letter entries");
                }
                purged
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to purge resolved dead-letter entries");
                0
            }
        }
    }

    /// Replay one claimed entry and persist the outcome.
    async fn replay(
        &self,
        mut entry: DeadLetterEntry,
        now: Timestamp,
    ) -> Result<ReplayOutcome, CoreError> {
        let plugin = match self.plugins.find_plugin(entry.plugin_id).await {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::warn!(
                    entry_id = entry.id,
                    plugin_id = entry.plugin_id,
                    error = %e,
                    "Plugin lookup failed, deferring dead-letter replay"
                );
                entry.defer(now + chrono_duration(self.settings.scan_interval), now);
                self.queue.store().save(&entry).await?;
                return Ok(ReplayOutcome::Deferred);
            }
        };

        match self.attempt(&entry, plugin.as_ref()).await {
            Replay::Inserted(inserted_id) => {
                entry.mark_resolved(now);
                self.queue.store().save(&entry).await?;
                tracing::info!(
                    entry_id = entry.id,
                    plugin_id = entry.plugin_id,
                    table = %entry.table_name,
                    ?inserted_id,
                    "Dead-letter entry replayed"
                );
                Ok(ReplayOutcome::Resolved)
            }
            Replay::Blocked(retry_after) => {
                entry.defer(now + chrono_duration(retry_after), now);
                self.queue.store().save(&entry).await?;
                tracing::debug!(
                    entry_id = entry.id,
                    plugin_id = entry.plugin_id,
                    "Breaker open, dead-letter replay deferred"
                );
                Ok(ReplayOutcome::Deferred)
            }
            Replay::Failed { reason, unrecoverable } => {
                let status = if unrecoverable {
                    entry.attempt_count += 1;
                    entry.mark_exhausted(reason, now);
                    DeadLetterStatus::Exhausted
                } else {
                    entry.record_failure(self.queue.policy(), reason, now)
                };
                self.queue.store().save(&entry).await?;

                if status != DeadLetterStatus::Exhausted {
                    tracing::warn!(
                        entry_id = entry.id,
                        plugin_id = entry.plugin_id,
                        attempts = entry.attempt_count,
                        next_retry_at = ?entry.next_retry_at,
                        reason = %entry.failure_reason,
                        "Dead-letter replay failed"
                    );
                    return Ok(ReplayOutcome::Rescheduled);
                }

                tracing::error!(
                    entry_id = entry.id,
                    plugin_id = entry.plugin_id,
                    table = %entry.table_name,
                    attempts = entry.attempt_count,
                    reason = %entry.failure_reason,
                    "Dead-letter entry exhausted, needs manual attention"
                );
                if let Some(plugin) = &plugin {
                    self.notify_exhausted(plugin, &entry);
                }
                Ok(ReplayOutcome::Exhausted)
            }
        }
    }

    async fn attempt(&self, entry: &DeadLetterEntry, plugin: Option<&Plugin>) -> Replay {
        let plugin = match plugin {
            None => return Replay::failed(format!("Plugin {} no longer exists", entry.plugin_id)),
            Some(p) if !p.is_active => {
                return Replay::failed(format!("Plugin {} is inactive", entry.plugin_id))
            }
            Some(p) => p,
        };

        let connector = self.factory.for_plugin(plugin).await;
        match connector
            .execute_insert(&entry.table_name, &entry.payload)
            .await
        {
            Ok(id) => Replay::Inserted(id),
            Err(ConnectorError::CircuitOpen { retry_after, .. }) => Replay::Blocked(retry_after),
            Err(e) => Replay::Failed {
                unrecoverable: matches!(e, ConnectorError::Credentials(_)),
                reason: e.to_string(),
            },
        }
    }

    fn notify_exhausted(&self, plugin: &Plugin, entry: &DeadLetterEntry) {
        self.webhooks.send_batch_fire_and_forget(
            plugin.id,
            &plugin.webhooks,
            WebhookEvent::DeadLetterExhausted,
            serde_json::json!({
                "entry_id": entry.id,
                "plugin_id": entry.plugin_id,
                "table": entry.table_name,
                "attempt_count": entry.attempt_count,
                "failure_reason": entry.failure_reason,
                "created_at": entry.created_at,
            }),
        );
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
