//! Completion records.

use crate::core::{CompletionEvent, StageId, SubKey, TaskStatus, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One persisted stage task, keyed by `(stage, work_key, sub_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Stage that ran the task.
    pub stage: StageId,
    /// Work unit the task belongs to.
    pub work_key: WorkKey,
    /// Sub-unit within the work unit.
    pub sub_key: SubKey,
    /// Reported status.
    pub status: TaskStatus,
    /// Rows the task wrote.
    pub row_count: u64,
    /// Timestamp reported by the executor.
    pub recorded_at: DateTime<Utc>,
    /// Executor error text for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl CompletionRecord {
    /// Returns true if the record is a success within `freshness` of `now`.
    #[must_use]
    pub fn is_fresh_success(&self, now: DateTime<Utc>, freshness: chrono::Duration) -> bool {
        self.status.is_success() && now.signed_duration_since(self.recorded_at) <= freshness
    }

    /// Total order used to pick the winner between two writes of the same key.
    ///
    /// Later timestamps win; ties fall back to status rank, then row count,
    /// then error detail, so the outcome never depends on arrival order.
    pub(crate) fn precedence(&self, other: &Self) -> Ordering {
        self.recorded_at
            .cmp(&other.recorded_at)
            .then_with(|| self.status.rank().cmp(&other.status.rank()))
            .then_with(|| self.row_count.cmp(&other.row_count))
            .then_with(|| self.error_detail.cmp(&other.error_detail))
    }
}

impl From<CompletionEvent> for CompletionRecord {
    fn from(event: CompletionEvent) -> Self {
        Self {
            stage: event.stage_name,
            work_key: event.work_key,
            sub_key: event.sub_key,
            status: event.status,
            row_count: event.row_count,
            recorded_at: event.timestamp,
            error_detail: event.error_detail,
        }
    }
}

/// Effect of an upsert on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// First record for the key.
    Inserted,
    /// Overwrote an older record.
    Replaced,
    /// Identical to the stored record.
    Duplicate,
    /// Older than the stored record; ignored.
    Stale,
}

impl UpsertOutcome {
    /// Returns true if the stored state is now the incoming record.
    #[must_use]
    pub fn is_current(&self) -> bool {
        !matches!(self, Self::Stale)
    }
}
