//! Alerts for data-correctness problems.

use super::EventSink;
use crate::core::{StageId, SubKey, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A task reported success with zero rows from a non-empty input.
    EmptySuspicious,
    /// A task failed.
    TaskFailed,
    /// The gate advanced before the threshold was reached.
    ForcedPartial,
    /// The expected set could not be resolved before `max_wait`.
    Stalled,
    /// A completeness check found gaps.
    CompletenessGap,
    /// A batch finished with missing or failed entities.
    BatchDegraded,
}

impl AlertKind {
    /// The event type used on the sink.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::EmptySuspicious => "alert.empty_suspicious",
            Self::TaskFailed => "alert.task_failed",
            Self::ForcedPartial => "alert.forced_partial",
            Self::Stalled => "alert.stalled",
            Self::CompletenessGap => "alert.completeness_gap",
            Self::BatchDegraded => "alert.batch_degraded",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// An alert with full context for the external alerting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// What went wrong.
    pub kind: AlertKind,
    /// Affected work unit.
    pub work_key: WorkKey,
    /// Stage that reported the problem, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    /// Affected sub-unit, if the alert is about one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_key: Option<SubKey>,
    /// Rows reported by the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Sub-units or entities still missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    /// Free-form context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Creates an alert for `work_key`.
    #[must_use]
    pub fn new(kind: AlertKind, work_key: impl Into<WorkKey>) -> Self {
        Self {
            kind,
            work_key: work_key.into(),
            stage: None,
            sub_key: None,
            row_count: None,
            missing: Vec::new(),
            detail: None,
            raised_at: Utc::now(),
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<StageId>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the sub-unit.
    #[must_use]
    pub fn with_sub_key(mut self, sub_key: impl Into<SubKey>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    /// Sets the reported row count.
    #[must_use]
    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }

    /// Attaches the list of missing sub-units or entities.
    #[must_use]
    pub fn with_missing<I, T>(mut self, missing: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        self.missing = missing.into_iter().map(|m| m.to_string()).collect();
        self
    }

    /// Sets a free-form detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sends the alert to `sink`.
    pub async fn raise(&self, sink: &dyn EventSink) {
        sink.emit(self.kind.event_type(), serde_json::to_value(self).ok())
            .await;
    }
}
