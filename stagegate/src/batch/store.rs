//! Canonical destination store.

use super::{ConsolidationKey, StagedRow};
use crate::core::WorkKey;
use crate::errors::StagegateError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::AddAssign;

/// What an upsert changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Keys that were absent.
    pub inserted: usize,
    /// Keys whose payload changed.
    pub updated: usize,
    /// Keys already holding the same payload.
    pub unchanged: usize,
}

impl MergeStats {
    /// Rows written or confirmed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

impl AddAssign for MergeStats {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// The canonical store consolidation merges into.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Upserts `rows` into `partition`, keyed by [`ConsolidationKey`].
    ///
    /// May fail with `ConsolidationConflict` when another writer touched
    /// the partition concurrently.
    async fn upsert_rows(
        &self,
        partition: &WorkKey,
        rows: &[StagedRow],
    ) -> Result<MergeStats, StagegateError>;

    /// Number of rows in `partition`.
    async fn row_count(&self, partition: &WorkKey) -> Result<usize, StagegateError>;

    /// Returns the stored payload for `key`.
    async fn get(&self, key: &ConsolidationKey) -> Result<Option<Value>, StagegateError>;
}

/// A process-local canonical store.
#[derive(Debug, Default)]
pub struct InMemoryCanonicalStore {
    partitions: DashMap<WorkKey, BTreeMap<ConsolidationKey, Value>>,
}

impl InMemoryCanonicalStore {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn upsert_rows(
        &self,
        partition: &WorkKey,
        rows: &[StagedRow],
    ) -> Result<MergeStats, StagegateError> {
        let mut stats = MergeStats::default();
        let mut table = self.partitions.entry(partition.clone()).or_default();
        for row in rows {
            match table.insert(row.key.clone(), row.payload.clone()) {
                None => stats.inserted += 1,
                Some(previous) if previous == row.payload => stats.unchanged += 1,
                Some(_) => stats.updated += 1,
            }
        }
        Ok(stats)
    }

    async fn row_count(&self, partition: &WorkKey) -> Result<usize, StagegateError> {
        Ok(self.partitions.get(partition).map_or(0, |table| table.len()))
    }

    async fn get(&self, key: &ConsolidationKey) -> Result<Option<Value>, StagegateError> {
        Ok(self
            .partitions
            .get(&key.work_key)
            .and_then(|table| table.get(key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryCanonicalStore::new();
        let partition = WorkKey::from("D");
        let rows = vec![
            StagedRow::new(ConsolidationKey::new("D", "p1", None), json!({"pts": 20})),
            StagedRow::new(ConsolidationKey::new("D", "p2", Some(0.5)), json!({"pts": 11})),
        ];

        let first = store.upsert_rows(&partition, &rows).await.unwrap();
        let second = store.upsert_rows(&partition, &rows).await.unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.row_count(&partition).await.unwrap(), 2);
    }
}
