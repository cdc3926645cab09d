//! Dead-letter entries for rows that failed to insert into a plugin database.
//!
//! Entry lifecycle:
//!
//! ```text
//! push -> pending --claim--> retrying --replay ok--> resolved
//!            ^                  |
//!            +---- replay err --+--(attempt_count > max_attempts)--> exhausted
//! ```
//!
//! `resolved` and `exhausted` are terminal. The retry decision lives here as
//! pure functions over [`DeadLetterEntry`] so every store backend applies the
//! same rules.

pub mod memory;
pub mod store;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};
use crate::value::RowValues;

pub use memory::MemoryDeadLetterStore;
pub use store::{DeadLetterCounts, DeadLetterStore};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Exhausted,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Exhausted => "exhausted",
            Self::Resolved => "resolved",
        }
    }

    /// No further transitions are allowed from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Resolved)
    }
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "exhausted" => Ok(Self::Exhausted),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!(
                "Invalid dead-letter status '{s}'. Must be one of: pending, retrying, exhausted, resolved"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A failed row about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub plugin_id: DbId,
    pub table_name: String,
    pub payload: RowValues,
    pub failure_reason: String,
    pub next_retry_at: Timestamp,
}

/// A persisted dead-letter entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub id: DbId,
    pub plugin_id: DbId,
    pub table_name: String,
    /// Coerced column values exactly as they were bound on the failed insert.
    pub payload: RowValues,
    /// Error message of the most recent failed attempt.
    pub failure_reason: String,
    pub attempt_count: u32,
    /// `None` once the entry is terminal.
    pub next_retry_at: Option<Timestamp>,
    pub status: DeadLetterStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl DeadLetterEntry {
    /// Record a failed replay.
    ///
    /// Increments `attempt_count`; past the policy bound the entry becomes
    /// `exhausted`, otherwise it goes back to `pending` with a later
    /// `next_retry_at`. Returns the new status.
    pub fn record_failure(
        &mut self,
        policy: &DeadLetterPolicy,
        reason: impl Into<String>,
        now: Timestamp,
    ) -> DeadLetterStatus {
        self.attempt_count += 1;
        self.failure_reason = reason.into();
        self.updated_at = now;

        if self.attempt_count > policy.max_attempts {
            self.status = DeadLetterStatus::Exhausted;
            self.next_retry_at = None;
        } else {
            self.status = DeadLetterStatus::Pending;
            self.next_retry_at = Some(policy.next_retry_at(self.attempt_count, now));
        }
        self.status
    }

    /// Give up on the entry without spending the rest of its retry budget.
    /// Used for failures no replay can fix.
    pub fn mark_exhausted(&mut self, reason: impl Into<String>, now: Timestamp) {
        self.status = DeadLetterStatus::Exhausted;
        self.failure_reason = reason.into();
        self.next_retry_at = None;
        self.updated_at = now;
    }

    pub fn mark_resolved(&mut self, now: Timestamp) {
        self.status = DeadLetterStatus::Resolved;
        self.next_retry_at = None;
        self.resolved_at = Some(now);
        self.updated_at = now;
    }

    /// Put a claimed entry back to `pending` until `until` without spending
    /// an attempt. Used when the replay never reached the database.
    pub fn defer(&mut self, until: Timestamp, now: Timestamp) {
        self.status = DeadLetterStatus::Pending;
        self.next_retry_at = Some(until);
        self.updated_at = now;
    }

    /// Operator action: give an exhausted entry a fresh retry budget.
    pub fn requeue(&mut self, now: Timestamp) {
        self.status = DeadLetterStatus::Pending;
        self.attempt_count = 0;
        self.next_retry_at = Some(now);
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry budget and backoff schedule for dead-letter replays.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPolicy {
    /// Failed replays allowed before the entry is exhausted.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 4,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl DeadLetterPolicy {
    /// Delay before the next replay after `attempt` failed replays.
    ///
    /// `min(base * multiplier^attempt, max)` plus 0-25% jitter. Never zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = (self.base_delay.as_millis() as u64).max(1);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(attempt);
        let max_ms = (self.max_delay.as_millis() as u64).max(base_ms);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);

        let jitter = rand::rng().random_range(0..=delay_ms / 4);
        Duration::from_millis(delay_ms.saturating_add(jitter))
    }

    pub fn next_retry_at(&self, attempt: u32, now: Timestamp) -> Timestamp {
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }

    /// Build the entry for a row that just failed its first insert.
    pub fn new_entry(
        &self,
        plugin_id: DbId,
        table_name: impl Into<String>,
        payload: RowValues,
        failure_reason: impl Into<String>,
        now: Timestamp,
    ) -> NewDeadLetter {
        NewDeadLetter {
            plugin_id,
            table_name: table_name.into(),
            payload,
            failure_reason: failure_reason.into(),
            next_retry_at: self.next_retry_at(0, now),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlValue;
    use chrono::Utc;

    fn entry(now: Timestamp) -> DeadLetterEntry {
        let mut payload = RowValues::new();
        payload.insert("email".into(), SqlValue::Text("a@example.com".into()));
        DeadLetterEntry {
            id: 1,
            plugin_id: 7,
            table_name: "leads".into(),
            payload,
            failure_reason: "duplicate key".into(),
            attempt_count: 0,
            next_retry_at: Some(now),
            status: DeadLetterStatus::Retrying,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    #[test]
    fn backoff_is_positive_and_grows_by_multiplier() {
        let policy = DeadLetterPolicy::default();
        for attempt in 0..4 {
            let d = policy.backoff(attempt).as_millis() as u64;
            let base = 1000 * 4u64.pow(attempt);
            assert!(d >= base && d <= base + base / 4, "attempt {attempt}: {d}ms");
        }
    }

    #[test]
    fn backoff_is_capped_before_jitter() {
        let policy = DeadLetterPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = policy.backoff(20);
        assert!(d >= Duration::from_secs(10) && d <= Duration::from_millis(12_500));
    }

    #[test]
    fn zero_base_delay_still_schedules_in_future() {
        let policy = DeadLetterPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(policy.backoff(0) > Duration::ZERO);
    }

    #[test]
    fn new_entry_is_scheduled_after_now() {
        let now = Utc::now();
        let new = DeadLetterPolicy::default().new_entry(7, "leads", RowValues::new(), "boom", now);
        assert!(new.next_retry_at > now);
    }

    #[test]
    fn failures_push_next_retry_later_until_exhausted() {
        let policy = DeadLetterPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let start = Utc::now();
        let mut e = entry(start);
        let mut last = start;

        for expected_attempt in 1..=3 {
            let status = e.record_failure(&policy, "still failing", last);
            assert_eq!(status, DeadLetterStatus::Pending);
            assert_eq!(e.attempt_count, expected_attempt);
            let next = e.next_retry_at.unwrap();
            assert!(next > last);
            last = next;
        }

        let status = e.record_failure(&policy, "final failure", last);
        assert_eq!(status, DeadLetterStatus::Exhausted);
        assert!(status.is_terminal());
        assert_eq!(e.attempt_count, 4);
        assert_eq!(e.next_retry_at, None);
        assert_eq!(e.failure_reason, "final failure");
    }

    #[test]
    fn mark_exhausted_skips_remaining_budget() {
        let now = Utc::now();
        let mut e = entry(now);

        e.mark_exhausted("credentials could not be decrypted", now);

        assert_eq!(e.status, DeadLetterStatus::Exhausted);
        assert_eq!(e.attempt_count, 0);
        assert_eq!(e.next_retry_at, None);
        assert_eq!(e.failure_reason, "credentials could not be decrypted");
    }

    #[test]
    fn resolve_clears_schedule() {
        let now = Utc::now();
        let mut e = entry(now);
        e.mark_resolved(now);
        assert_eq!(e.status, DeadLetterStatus::Resolved);
        assert_eq!(e.resolved_at, Some(now));
        assert_eq!(e.next_retry_at, None);
    }

    #[test]
    fn defer_keeps_attempt_budget() {
        let now = Utc::now();
        let mut e = entry(now);
        e.attempt_count = 2;
        let until = now + chrono::Duration::seconds(30);

        e.defer(until, now);

        assert_eq!(e.status, DeadLetterStatus::Pending);
        assert_eq!(e.attempt_count, 2);
        assert_eq!(e.next_retry_at, Some(until));
    }

    #[test]
    fn requeue_resets_exhausted_entry() {
        let now = Utc::now();
        let policy = DeadLetterPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let mut e = entry(now);
        assert_eq!(e.record_failure(&policy, "boom", now), DeadLetterStatus::Exhausted);

        e.requeue(now);

        assert_eq!(e.status, DeadLetterStatus::Pending);
        assert_eq!(e.attempt_count, 0);
        assert_eq!(e.next_retry_at, Some(now));
    }

    #[test]
    fn status_parses_and_displays() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Retrying,
            DeadLetterStatus::Exhausted,
            DeadLetterStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<DeadLetterStatus>(), Ok(status));
        }
        assert!("stuck".parse::<DeadLetterStatus>().is_err());
    }
}
