//! Collaborator traits for completeness checks.

use crate::core::{StageId, SubKey, WorkKey};
use crate::errors::StagegateError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// The external schedule/reference service.
///
/// It may itself be unavailable; callers must treat an error as "expected
/// set unknown", never as "nothing expected".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferenceProvider: Send + Sync {
    /// Returns the sub-units `stage` is expected to produce for `work_key`.
    async fn expected_sub_units(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<BTreeSet<SubKey>, StagegateError>;
}

/// One independent source of observed data.
#[async_trait]
pub trait CoverageSource: Send + Sync {
    /// Stable identifier, used to look up the source's threshold.
    fn source_id(&self) -> &str;

    /// Returns the number of signals recorded per entity. Entities absent
    /// from the map have zero signals.
    async fn signal_counts(
        &self,
        work_key: &WorkKey,
        entities: &BTreeSet<SubKey>,
    ) -> Result<HashMap<SubKey, u64>, StagegateError>;
}
