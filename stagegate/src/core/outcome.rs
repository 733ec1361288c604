//! Explicit stage outcome carrying row counts and a classification.
//!
//! A stage never reports "success with empty defaults": every outcome says
//! how many rows it processed, how many it was given, and how that pair was
//! classified, so callers must branch on a suspicious empty result.

use super::TaskStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a completed stage invocation was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    /// Rows were produced.
    Success,
    /// No rows from an empty input.
    Empty,
    /// No rows from a non-empty input.
    EmptySuspicious,
    /// A suspicious empty result the caller confirmed as legitimate.
    ExpectedEmpty,
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Empty => write!(f, "empty"),
            Self::EmptySuspicious => write!(f, "empty_suspicious"),
            Self::ExpectedEmpty => write!(f, "expected_empty"),
        }
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Rows written.
    pub rows_processed: u64,
    /// Rows the invocation was given.
    pub input_rows: u64,
    /// Rows the caller expected, when known.
    pub expected_rows: Option<u64>,
    /// Classification of the counts.
    pub classification: OutcomeClass,
}

impl StageOutcome {
    /// Classifies a raw `(rows_processed, input_rows)` pair.
    #[must_use]
    pub fn from_counts(rows_processed: u64, input_rows: u64) -> Self {
        let classification = match (rows_processed, input_rows) {
            (0, 0) => OutcomeClass::Empty,
            (0, _) => OutcomeClass::EmptySuspicious,
            _ => OutcomeClass::Success,
        };

        Self {
            rows_processed,
            input_rows,
            expected_rows: None,
            classification,
        }
    }

    /// Sets the expected row count.
    #[must_use]
    pub fn with_expected_rows(mut self, expected: u64) -> Self {
        self.expected_rows = Some(expected);
        self
    }

    /// Accepts a suspicious empty result as legitimate (e.g. an empty calendar slot).
    #[must_use]
    pub fn accept_empty(mut self) -> Self {
        if self.classification == OutcomeClass::EmptySuspicious {
            self.classification = OutcomeClass::ExpectedEmpty;
        }
        self
    }

    /// Re-derives the classification from the counts.
    ///
    /// A confirmed `ExpectedEmpty` survives when the counts still describe
    /// an empty result from non-empty input.
    #[must_use]
    pub fn reclassify(self) -> Self {
        let accepted = self.classification == OutcomeClass::ExpectedEmpty;
        let mut outcome = Self {
            classification: Self::from_counts(self.rows_processed, self.input_rows).classification,
            ..self
        };
        if accepted {
            outcome = outcome.accept_empty();
        }
        outcome
    }

    /// Returns true if the result is a silent empty result.
    #[must_use]
    pub fn is_suspicious(&self) -> bool {
        self.classification == OutcomeClass::EmptySuspicious
    }

    /// Returns the status to record in the completion tracker.
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        match self.classification {
            OutcomeClass::EmptySuspicious => TaskStatus::EmptySuspicious,
            OutcomeClass::Success | OutcomeClass::Empty | OutcomeClass::ExpectedEmpty => {
                TaskStatus::Success
            }
        }
    }
}
