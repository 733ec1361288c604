//! Single-writer consolidation of staging areas.

use super::{CanonicalStore, ConsolidationKey, MergeStats, StagedRow, StagingArea};
use crate::core::WorkKey;
use crate::errors::StagegateError;
use crate::observability::SpanTimer;
use crate::retry::{DefaultClassifier, RetryExecutor};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Merges staging areas into the canonical store.
///
/// At most one consolidation runs per work key at a time; concurrent-update
/// conflicts raised by the store are retried as transient errors.
pub struct Consolidator {
    store: Arc<dyn CanonicalStore>,
    retry: RetryExecutor,
    tokens: DashMap<WorkKey, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consolidator")
            .field("retry", &self.retry)
            .field("partitions", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl Consolidator {
    /// Creates a consolidator writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CanonicalStore>, retry: RetryExecutor) -> Self {
        Self {
            store,
            retry,
            tokens: DashMap::new(),
        }
    }

    /// The destination store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CanonicalStore> {
        &self.store
    }

    /// Merges `areas` into the `work_key` partition.
    ///
    /// Rows are deduplicated by [`ConsolidationKey`] first; when two workers
    /// staged the same key the later row wins. Running this twice on the
    /// same areas leaves the store unchanged the second time.
    pub async fn consolidate(
        &self,
        work_key: &WorkKey,
        areas: &[StagingArea],
    ) -> Result<MergeStats, StagegateError> {
        let rows = Self::dedupe(work_key, areas)?;

        let token = self.tokens.entry(work_key.clone()).or_default().clone();
        let merged = {
            let _guard = token.lock().await;
            self.merge(work_key, areas.len(), &rows).await
        };
        drop(token);
        self.tokens
            .remove_if(work_key, |_, token| Arc::strong_count(token) == 1);
        merged
    }

    async fn merge(
        &self,
        work_key: &WorkKey,
        area_count: usize,
        rows: &[StagedRow],
    ) -> Result<MergeStats, StagegateError> {
        let timer = SpanTimer::start("batch.consolidate");
        let store = self.store.as_ref();
        let stats = self
            .retry
            .execute(
                "consolidate",
                move || store.upsert_rows(work_key, rows),
                &DefaultClassifier,
            )
            .await
            .map_err(StagegateError::from)?;

        info!(
            work_key = %work_key,
            areas = area_count,
            rows = rows.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            elapsed_ms = timer.finish(),
            "Consolidated staging areas"
        );
        Ok(stats)
    }

    fn dedupe(work_key: &WorkKey, areas: &[StagingArea]) -> Result<Vec<StagedRow>, StagegateError> {
        let mut merged: BTreeMap<&ConsolidationKey, &StagedRow> = BTreeMap::new();
        for row in areas.iter().flat_map(|area| &area.rows) {
            if &row.key.work_key != work_key {
                return Err(StagegateError::PermanentData(format!(
                    "row {} staged into consolidation of {work_key}",
                    row.key
                )));
            }
            merged
                .entry(&row.key)
                .and_modify(|existing| {
                    if row.staged_at >= existing.staged_at {
                        *existing = row;
                    }
                })
                .or_insert(row);
        }
        Ok(merged.into_values().cloned().collect())
    }
}
