//! Dead-letter queue for rows that failed to insert.
//!
//! [`DeadLetterQueue`] applies the retry policy on top of any
//! [`DeadLetterStore`]; [`RetryScheduler`] replays due entries in the
//! background.

mod scheduler;

use std::sync::Arc;

use chrono::Utc;
use formflow_core::dead_letter::{
    DeadLetterCounts, DeadLetterEntry, DeadLetterPolicy, DeadLetterStatus, DeadLetterStore,
};
use formflow_core::error::CoreError;
use formflow_core::types::DbId;
use formflow_core::value::RowValues;

pub use scheduler::{CycleReport, RetryScheduler, SchedulerSettings};

pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    policy: DeadLetterPolicy,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DeadLetterStore>, policy: DeadLetterPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &DeadLetterPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Record a row that failed its first insert. It becomes due after
    /// `backoff(0)`.
    pub async fn push(
        &self,
        plugin_id: DbId,
        table_name: &str,
        payload: RowValues,
        failure_reason: &str,
    ) -> Result<DeadLetterEntry, CoreError> {
        let entry = self.policy.new_entry(
            plugin_id,
            table_name,
            payload,
            failure_reason,
            Utc::now(),
        );
        let entry = self.store.push(entry).await?;
        tracing::info!(
            entry_id = entry.id,
            plugin_id,
            table = table_name,
            "Row dead-lettered"
        );
        Ok(entry)
    }

    /// Record a row whose failure no replay can fix. The entry is stored
    /// already exhausted so it waits for an operator instead of retrying.
    pub async fn push_exhausted(
        &self,
        plugin_id: DbId,
        table_name: &str,
        payload: RowValues,
        failure_reason: &str,
    ) -> Result<DeadLetterEntry, CoreError> {
        let now = Utc::now();
        let entry = self
            .policy
            .new_entry(plugin_id, table_name, payload, failure_reason, now);
        let mut entry = self.store.push(entry).await?;
        entry.mark_exhausted(failure_reason, now);
        self.store.save(&entry).await?;
        tracing::warn!(
            entry_id = entry.id,
            plugin_id,
            table = table_name,
            "Row dead-lettered as exhausted, needs manual attention"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: DbId) -> Result<Option<DeadLetterEntry>, CoreError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError> {
        self.store.list_by_status(status, limit).await
    }

    pub async fn counts(&self) -> Result<DeadLetterCounts, CoreError> {
        self.store.count_by_status().await
    }

    /// Give an exhausted entry a fresh retry budget, due immediately.
    pub async fn requeue(&self, id: DbId) -> Result<DeadLetterEntry, CoreError> {
        let mut entry = self.require(id).await?;
        if entry.status != DeadLetterStatus::Exhausted {
            return Err(CoreError::Conflict(format!(
                "Dead-letter entry {id} is {}, only exhausted entries can be requeued",
                entry.status
            )));
        }
        entry.requeue(Utc::now());
        self.store.save(&entry).await?;
        tracing::info!(entry_id = id, plugin_id = entry.plugin_id, "Dead-letter entry requeued");
        Ok(entry)
    }

    /// Mark an entry resolved by hand, e.g. after the row was fixed and
    /// inserted outside FormFlow.
    pub async fn resolve(&self, id: DbId) -> Result<DeadLetterEntry, CoreError> {
        let mut entry = self.require(id).await?;
        if entry.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Dead-letter entry {id} is already {}",
                entry.status
            )));
        }
        entry.mark_resolved(Utc::now());
        self.store.save(&entry).await?;
        tracing::info!(entry_id = id, plugin_id = entry.plugin_id, "Dead-letter entry resolved manually");
        Ok(entry)
    }

    async fn require(&self, id: DbId) -> Result<DeadLetterEntry, CoreError> {
        self.store.get(id).await?.ok_or(CoreError::NotFound {
            entity: "DeadLetterEntry",
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use formflow_core::dead_letter::MemoryDeadLetterStore;
    use formflow_core::value::SqlValue;

    use super::*;

    fn queue() -> DeadLetterQueue {
        DeadLetterQueue::new(
            Arc::new(MemoryDeadLetterStore::new()),
            DeadLetterPolicy {
                max_attempts: 0,
                ..Default::default()
            },
        )
    }

    fn row() -> RowValues {
        let mut row = RowValues::new();
        row.insert("email".into(), SqlValue::Text("a@x.io".into()));
        row
    }

    #[tokio::test]
    async fn push_schedules_pending_entry() {
        let queue = queue();
        let before = Utc::now();

        let entry = queue.push(3, "leads", row(), "duplicate key").await.unwrap();

        assert_eq!(entry.status, DeadLetterStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.failure_reason, "duplicate key");
        assert!(entry.next_retry_at.unwrap() > before);
        assert_eq!(queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn push_exhausted_is_never_due() {
        let queue = queue();

        let entry = queue
            .push_exhausted(3, "leads", row(), "credentials could not be decrypted")
            .await
            .unwrap();

        assert_eq!(entry.status, DeadLetterStatus::Exhausted);
        assert_eq!(entry.next_retry_at, None);
        let stored = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeadLetterStatus::Exhausted);
        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.pending, counts.exhausted), (0, 1));
    }

    #[tokio::test]
    async fn requeue_only_accepts_exhausted_entries() {
        let queue = queue();
        let mut entry = queue.push(3, "leads", row(), "boom").await.unwrap();

        assert_matches!(queue.requeue(entry.id).await, Err(CoreError::Conflict(_)));

        entry.record_failure(queue.policy(), "boom", Utc::now());
        queue.store().save(&entry).await.unwrap();

        let requeued = queue.requeue(entry.id).await.unwrap();
        assert_eq!(requeued.status, DeadLetterStatus::Pending);
        assert_eq!(requeued.attempt_count, 0);
    }

    #[tokio::test]
    async fn resolve_rejects_terminal_entries() {
        let queue = queue();
        let entry = queue.push(3, "leads", row(), "boom").await.unwrap();

        let resolved = queue.resolve(entry.id).await.unwrap();
        assert_eq!(resolved.status, DeadLetterStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        assert_matches!(queue.resolve(entry.id).await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        assert_matches!(
            queue().requeue(99).await,
            Err(CoreError::NotFound { id: 99, .. })
        );
    }
}
