//! Completeness results and reports.

use crate::core::{SubKey, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of a completeness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletenessStatus {
    /// Every source met its threshold.
    Ok,
    /// Some sources met their threshold.
    Degraded,
    /// No source met its threshold.
    Failed,
}

impl fmt::Display for CompletenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl CompletenessStatus {
    /// Combines per-source statuses: OK when every source is OK, FAILED
    /// when none is, DEGRADED otherwise. No sources at all is OK.
    #[must_use]
    pub fn combine<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let (mut ok, mut total) = (0usize, 0usize);
        for status in statuses {
            total += 1;
            if status == Self::Ok {
                ok += 1;
            }
        }
        if ok == total {
            Self::Ok
        } else if ok == 0 {
            Self::Failed
        } else {
            Self::Degraded
        }
    }
}

/// Coverage of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCoverage {
    /// Id of the coverage source.
    pub source_id: String,
    /// Expected entities at or above the noise floor.
    pub observed_count: usize,
    /// Size of the reference expected set.
    pub expected_count: usize,
    /// Ratio the source had to reach.
    pub threshold: f64,
    /// OK when the ratio reached the threshold.
    pub status: CompletenessStatus,
    /// Expected entities the source did not cover.
    #[serde(default)]
    pub missing: Vec<SubKey>,
    /// Set when the source could not be queried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceCoverage {
    /// Observed over expected, 1.0 for an empty expected set.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        crate::core::completion_ratio(self.observed_count, self.expected_count)
    }
}

/// Completeness of one work unit across all sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessResult {
    /// Work unit checked.
    pub work_key: WorkKey,
    /// Size of the reference expected set.
    pub expected_count: usize,
    /// Coverage keyed by source id.
    pub per_source: BTreeMap<String, SourceCoverage>,
    /// Combined status of every source.
    pub overall_status: CompletenessStatus,
    /// Entities missing from at least one failing source.
    pub discrepancies: Vec<SubKey>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl CompletenessResult {
    /// Returns true unless every source is OK.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        self.overall_status != CompletenessStatus::Ok
    }

    /// One line per failing source, for alert detail.
    #[must_use]
    pub fn gap_summary(&self) -> String {
        self.per_source
            .values()
            .filter(|c| c.status != CompletenessStatus::Ok)
            .map(|c| match &c.error {
                Some(err) => format!("{}: unavailable ({err})", c.source_id),
                None => format!(
                    "{}: {}/{} below {:.0}%",
                    c.source_id,
                    c.observed_count,
                    c.expected_count,
                    c.threshold * 100.0
                ),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Results of a sweep over several work units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// One result per resolved day.
    pub results: Vec<CompletenessResult>,
    /// Work units whose expected set could not be resolved.
    #[serde(default)]
    pub unresolved: Vec<(WorkKey, String)>,
}

impl CompletenessReport {
    /// Returns true if any work unit has gaps or could not be checked.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        !self.unresolved.is_empty() || self.results.iter().any(CompletenessResult::has_gaps)
    }

    /// Process exit status for scheduler automation.
    ///
    /// Always 0 unless `alert_on_gaps` is set; then 1 for coverage gaps and
    /// 2 when a work unit could not be checked at all.
    #[must_use]
    pub fn exit_code(&self, alert_on_gaps: bool) -> i32 {
        if !alert_on_gaps {
            0
        } else if !self.unresolved.is_empty() {
            2
        } else if self.has_gaps() {
            1
        } else {
            0
        }
    }
}
