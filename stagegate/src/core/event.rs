//! Inbound completion events and outbound trigger events.

use super::{StageId, SubKey, TaskStatus, TriggerReason, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A completion event published by an upstream stage executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// The stage that ran.
    pub stage_name: StageId,
    /// The work unit.
    pub work_key: WorkKey,
    /// The sub-unit within the work unit.
    pub sub_key: SubKey,
    /// Outcome of the task.
    pub status: TaskStatus,
    /// Rows written by the task.
    #[serde(default)]
    pub row_count: u64,
    /// When the task finished.
    pub timestamp: DateTime<Utc>,
    /// Error detail for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl CompletionEvent {
    /// Creates a successful completion event stamped now.
    #[must_use]
    pub fn success(
        stage_name: impl Into<StageId>,
        work_key: impl Into<WorkKey>,
        sub_key: impl Into<SubKey>,
        row_count: u64,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            work_key: work_key.into(),
            sub_key: sub_key.into(),
            status: TaskStatus::Success,
            row_count,
            timestamp: Utc::now(),
            error_detail: None,
        }
    }

    /// Creates a failed completion event stamped now.
    #[must_use]
    pub fn failed(
        stage_name: impl Into<StageId>,
        work_key: impl Into<WorkKey>,
        sub_key: impl Into<SubKey>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            work_key: work_key.into(),
            sub_key: sub_key.into(),
            status: TaskStatus::Failed,
            row_count: 0,
            timestamp: Utc::now(),
            error_detail: Some(error.into()),
        }
    }

    /// Overrides the status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Parses an event from a bus message.
    pub fn from_json(payload: &str) -> Result<Self, crate::errors::StagegateError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// A trigger event published to the next stage's executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// The stage to run.
    pub next_stage: StageId,
    /// The work unit to run it for.
    pub work_key: WorkKey,
    /// Why the trigger fired.
    pub trigger_reason: TriggerReason,
    /// The stage whose completions opened the gate.
    pub source_stage: StageId,
    /// Completeness epoch this trigger belongs to.
    pub epoch: u64,
    /// Completed sub-units at the time of the decision.
    pub completed: usize,
    /// Expected sub-units at the time of the decision.
    pub expected: usize,
    /// Expected sub-units that had not completed.
    #[serde(default)]
    pub missing: Vec<SubKey>,
    /// Set when a reconciliation sweep re-armed a forced trigger.
    #[serde(default)]
    pub top_up: bool,
    /// When the trigger was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Returns the completion ratio carried by the trigger.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        completion_ratio(self.completed, self.expected)
    }

    /// Returns true if the trigger was forced before completion.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.trigger_reason == TriggerReason::ForcedPartial
    }
}

/// `completed / expected`, defined as 1.0 for an empty expected set.
#[must_use]
pub fn completion_ratio(completed: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 1.0;
    }
    completed as f64 / expected as f64
}
