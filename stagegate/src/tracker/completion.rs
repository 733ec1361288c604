//! The completion tracker facade.

use super::{CompletionRecord, CompletionStore, InMemoryCompletionStore, UpsertOutcome};
use crate::core::{CompletionEvent, StageId, SubKey, WorkKey};
use crate::errors::StagegateError;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const NOTIFY_CAPACITY: usize = 1024;

/// Result of recording a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// The record as submitted.
    pub record: CompletionRecord,
    /// Whether the record replaced the stored one.
    pub outcome: UpsertOutcome,
}

/// Records completions and answers completion-set queries.
pub struct CompletionTracker {
    store: Arc<dyn CompletionStore>,
    notifier: broadcast::Sender<CompletionRecord>,
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("subscribers", &self.notifier.receiver_count())
            .finish()
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryCompletionStore::new()))
    }
}

impl CompletionTracker {
    /// Creates a tracker over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CompletionStore>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { store, notifier }
    }

    /// Upserts the record carried by `event`.
    ///
    /// Duplicates and out-of-order deliveries are not errors. Records that
    /// become (or already are) the stored state are broadcast to subscribers.
    pub async fn record_completion(
        &self,
        event: CompletionEvent,
    ) -> Result<Recorded, StagegateError> {
        let record = CompletionRecord::from(event);
        let outcome = self.store.upsert(record.clone()).await?;

        debug!(
            stage = %record.stage,
            work_key = %record.work_key,
            sub_key = %record.sub_key,
            status = %record.status,
            row_count = record.row_count,
            outcome = ?outcome,
            "Recorded completion"
        );

        if outcome.is_current() {
            // No subscribers is not an error.
            let _ = self.notifier.send(record.clone());
        } else {
            warn!(
                stage = %record.stage,
                work_key = %record.work_key,
                sub_key = %record.sub_key,
                "Ignored completion older than the stored record"
            );
        }

        Ok(Recorded { record, outcome })
    }

    /// Returns the sub keys of `(stage, work_key)` that succeeded within
    /// `freshness` of now.
    pub async fn completion_set(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
        freshness: Duration,
    ) -> Result<BTreeSet<SubKey>, StagegateError> {
        let window = chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        Ok(self
            .store
            .records_for(stage, work_key)
            .await?
            .into_iter()
            .filter(|record| record.is_fresh_success(now, window))
            .map(|record| record.sub_key)
            .collect())
    }

    /// Returns every stored record for `(stage, work_key)`.
    pub async fn records(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<Vec<CompletionRecord>, StagegateError> {
        self.store.records_for(stage, work_key).await
    }

    /// Subscribes to newly stored records.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionRecord> {
        self.notifier.subscribe()
    }
}
