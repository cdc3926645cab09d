//! In-process [`DeadLetterStore`], used by tests and single-node setups
//! without a database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::store::{DeadLetterCounts, DeadLetterStore};
use super::{DeadLetterEntry, DeadLetterStatus, NewDeadLetter};
use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

#[derive(Debug, Default)]
struct State {
    next_id: DbId,
    entries: BTreeMap<DbId, DeadLetterEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    state: Mutex<State>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, ordered by id.
    pub async fn all(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry, CoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let stored = DeadLetterEntry {
            id: state.next_id,
            plugin_id: entry.plugin_id,
            table_name: entry.table_name,
            payload: entry.payload,
            failure_reason: entry.failure_reason,
            attempt_count: 0,
            next_retry_at: Some(entry.next_retry_at),
            status: DeadLetterStatus::Pending,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        state.entries.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: DbId) -> Result<Option<DeadLetterEntry>, CoreError> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError> {
        let mut state = self.state.lock().await;

        let mut due: Vec<(Timestamp, DbId)> = state
            .entries
            .values()
            .filter(|e| e.status == DeadLetterStatus::Pending)
            .filter_map(|e| e.next_retry_at.filter(|at| *at <= now).map(|at| (at, e.id)))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.status = DeadLetterStatus::Retrying;
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound {
                entity: "DeadLetterEntry",
                id: entry.id,
            }),
        }
    }

    async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<DeadLetterCounts, CoreError> {
        let state = self.state.lock().await;
        let mut counts = DeadLetterCounts::default();
        for entry in state.entries.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }

    async fn release_stale_claims(&self, older_than: Timestamp) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for entry in state.entries.values_mut() {
            if entry.status == DeadLetterStatus::Retrying && entry.updated_at < older_than {
                entry.status = DeadLetterStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge_resolved(&self, older_than: Timestamp) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|_, e| {
            !(e.status == DeadLetterStatus::Resolved
                && e.resolved_at.is_some_and(|at| at < older_than))
        });
        Ok((before - state.entries.len()) as u64)
    }
}
