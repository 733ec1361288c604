//! Task status and trigger reason enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The recorded status of one stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task produced output.
    Success,
    /// The task failed.
    Failed,
    /// The task reported success but produced no rows from a non-empty input.
    EmptySuspicious,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::EmptySuspicious => write!(f, "empty_suspicious"),
        }
    }
}

impl TaskStatus {
    /// Returns true if the task counts toward gate completion.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the status should be surfaced to alerting.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Failed | Self::EmptySuspicious)
    }

    /// Tie-break rank used when two records carry the same timestamp.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Failed => 0,
            Self::EmptySuspicious => 1,
            Self::Success => 2,
        }
    }
}

/// Why a downstream stage was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// The completion ratio reached the gate threshold.
    Full,
    /// `max_wait` elapsed before the threshold was reached.
    ForcedPartial,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::ForcedPartial => write!(f, "forced_partial"),
        }
    }
}
