use async_trait::async_trait;
use serde::Serialize;

use super::{DeadLetterEntry, DeadLetterStatus, NewDeadLetter};
use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

/// Number of entries in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterCounts {
    pub pending: u64,
    pub retrying: u64,
    pub exhausted: u64,
    pub resolved: u64,
}

impl DeadLetterCounts {
    pub fn add(&mut self, status: DeadLetterStatus, n: u64) {
        match status {
            DeadLetterStatus::Pending => self.pending += n,
            DeadLetterStatus::Retrying => self.retrying += n,
            DeadLetterStatus::Exhausted => self.exhausted += n,
            DeadLetterStatus::Resolved => self.resolved += n,
        }
    }
}

/// Durable storage for dead-letter entries.
///
/// Implementations must make [`claim_due`](Self::claim_due) atomic: two
/// schedulers polling the same store never receive the same entry.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert a new `pending` entry with `attempt_count = 0`.
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry, CoreError>;

    async fn get(&self, id: DbId) -> Result<Option<DeadLetterEntry>, CoreError>;

    /// Move up to `limit` pending entries with `next_retry_at <= now` to
    /// `retrying` and return them, oldest schedule first.
    async fn claim_due(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError>;

    /// Persist status, attempt count, reason and schedule of `entry`.
    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), CoreError>;

    async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, CoreError>;

    async fn count_by_status(&self) -> Result<DeadLetterCounts, CoreError>;

    /// Return `retrying` entries claimed before `older_than` to `pending`.
    ///
    /// Recovers entries whose scheduler died mid-replay.
    async fn release_stale_claims(&self, older_than: Timestamp) -> Result<u64, CoreError>;

    /// Delete `resolved` entries resolved before `older_than`.
    async fn purge_resolved(&self, older_than: Timestamp) -> Result<u64, CoreError>;
}
