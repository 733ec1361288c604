//! Completion record persistence.

use super::{CompletionRecord, UpsertOutcome};
use crate::core::{StageId, SubKey, WorkKey};
use crate::errors::StagegateError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Externalized store of completion records.
///
/// Implementations must make `upsert` idempotent and commutative: applying
/// the same set of records in any order yields the same stored state.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// Inserts or overwrites the record for its key.
    async fn upsert(&self, record: CompletionRecord) -> Result<UpsertOutcome, StagegateError>;

    /// Returns every record for `(stage, work_key)`, ordered by sub key.
    async fn records_for(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<Vec<CompletionRecord>, StagegateError>;

    /// Returns the record for one key, if any.
    async fn get(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
        sub_key: &SubKey,
    ) -> Result<Option<CompletionRecord>, StagegateError>;
}

/// A process-local completion store.
#[derive(Debug, Default)]
pub struct InMemoryCompletionStore {
    records: DashMap<(StageId, WorkKey), BTreeMap<SubKey, CompletionRecord>>,
}

impl InMemoryCompletionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.len()).sum()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CompletionStore for InMemoryCompletionStore {
    async fn upsert(&self, record: CompletionRecord) -> Result<UpsertOutcome, StagegateError> {
        let mut partition = self
            .records
            .entry((record.stage.clone(), record.work_key.clone()))
            .or_default();

        let outcome = match partition.get(&record.sub_key) {
            None => UpsertOutcome::Inserted,
            Some(existing) => match record.precedence(existing) {
                Ordering::Greater => UpsertOutcome::Replaced,
                Ordering::Equal => UpsertOutcome::Duplicate,
                Ordering::Less => UpsertOutcome::Stale,
            },
        };

        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Replaced) {
            partition.insert(record.sub_key.clone(), record);
        }
        Ok(outcome)
    }

    async fn records_for(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<Vec<CompletionRecord>, StagegateError> {
        Ok(self
            .records
            .get(&(stage.clone(), work_key.clone()))
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
        sub_key: &SubKey,
    ) -> Result<Option<CompletionRecord>, StagegateError> {
        Ok(self
            .records
            .get(&(stage.clone(), work_key.clone()))
            .and_then(|partition| partition.get(sub_key).cloned()))
    }
}
