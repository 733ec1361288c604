//! Batch fan-out and fan-in.

use super::{
    BatchContext, CanonicalStore, Consolidator, ContextCache, ContextLoader, ContextSource,
    MergeStats, StagedRow, StagingStore, WorkerId, WorkerPool,
};
use crate::config::BatchConfig;
use crate::core::{EntityId, WorkKey};
use crate::errors::StagegateError;
use crate::events::{Alert, AlertKind, EventSink, LoggingEventSink};
use crate::observability::SpanTimer;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Computes the output rows for one entity.
#[async_trait]
pub trait EntityProcessor: Send + Sync {
    /// Processes `entity_id` given its slice of historical context, if any.
    async fn process(
        &self,
        work_key: &WorkKey,
        entity_id: &EntityId,
        context: Option<&Value>,
    ) -> Result<Vec<StagedRow>, StagegateError>;
}

/// State of one entity within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Not yet finished.
    Pending,
    /// Processed from the shared batch context.
    Done,
    /// Processed after an individual fallback fetch.
    FallbackDone,
    /// The processor or the fallback fetch returned an error.
    Failed,
    /// Still pending when the fan-in timeout elapsed.
    TimedOut,
}

impl EntityState {
    /// Returns true if the entity's output was staged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done | Self::FallbackDone)
    }
}

/// Overall state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    /// Workers are still running or consolidation has not finished.
    Running,
    /// Every entity was staged and consolidated.
    Complete,
    /// Finished with failed or timed-out entities, or a failed consolidation.
    Degraded,
}

/// Status of a submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Batch identifier (UUID v7).
    pub batch_id: Uuid,
    /// Partition the batch consolidates into.
    pub work_key: WorkKey,
    /// Overall state.
    pub state: BatchState,
    /// Per-entity state.
    pub entities: BTreeMap<EntityId, EntityState>,
    /// Error messages of failed entities.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<EntityId, String>,
    /// True when the bulk context fetch failed and every worker fell back.
    pub bulk_fetch_failed: bool,
    /// Consolidation result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeStats>,
    /// Terminal consolidation error, if consolidation gave up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation_error: Option<String>,
    /// When the batch was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When consolidation finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    fn new(batch_id: Uuid, work_key: WorkKey, entity_ids: &[EntityId]) -> Self {
        Self {
            batch_id,
            work_key,
            state: BatchState::Running,
            entities: entity_ids
                .iter()
                .map(|id| (id.clone(), EntityState::Pending))
                .collect(),
            errors: BTreeMap::new(),
            bulk_fetch_failed: false,
            merge: None,
            consolidation_error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Number of entities in `state`.
    #[must_use]
    pub fn count(&self, state: EntityState) -> usize {
        self.entities.values().filter(|s| **s == state).count()
    }

    fn record_worker(
        &mut self,
        entity_id: EntityId,
        result: Result<ContextSource, StagegateError>,
    ) {
        let state = match result {
            Ok(ContextSource::Shared) => EntityState::Done,
            Ok(ContextSource::Fallback) => EntityState::FallbackDone,
            Err(err) => {
                self.errors.insert(entity_id.clone(), err.to_string());
                EntityState::Failed
            }
        };
        self.entities.insert(entity_id, state);
    }

    /// Entities whose output was not staged.
    #[must_use]
    pub fn unfinished(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, state)| !state.is_success())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

struct BatchEntry {
    status: RwLock<BatchStatus>,
    done: watch::Sender<bool>,
}

/// Fans a batch of entities out to a bounded worker pool over one shared
/// context, then consolidates their staged output.
pub struct BatchCoordinator {
    loader: Arc<dyn ContextLoader>,
    processor: Arc<dyn EntityProcessor>,
    cache: ContextCache,
    staging: StagingStore,
    consolidator: Consolidator,
    pool: WorkerPool,
    fan_in_timeout: Duration,
    alerts: Arc<dyn EventSink>,
    batches: DashMap<Uuid, Arc<BatchEntry>>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("pool", &self.pool)
            .field("fan_in_timeout", &self.fan_in_timeout)
            .field("batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Creates a coordinator with a pool of `config.worker_pool_size` workers.
    #[must_use]
    pub fn new(
        loader: Arc<dyn ContextLoader>,
        processor: Arc<dyn EntityProcessor>,
        store: Arc<dyn CanonicalStore>,
        retry: RetryExecutor,
        config: &BatchConfig,
    ) -> Self {
        Self {
            loader,
            processor,
            cache: ContextCache::new(),
            staging: StagingStore::new(),
            consolidator: Consolidator::new(store, retry),
            pool: WorkerPool::new(config.worker_pool_size),
            fan_in_timeout: config.fan_in_timeout(),
            alerts: Arc::new(LoggingEventSink::default()),
            batches: DashMap::new(),
        }
    }

    /// Sets the sink for batch alerts and lifecycle events.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn EventSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Published contexts of batches still running.
    #[must_use]
    pub fn context_cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Starts a batch and returns its id immediately.
    ///
    /// Duplicate entity ids are processed once. The status stays queryable
    /// until [`forget`](Self::forget) is called, so callers polling by id
    /// must forget finished batches.
    pub fn submit_batch(
        self: &Arc<Self>,
        work_key: impl Into<WorkKey>,
        mut entity_ids: Vec<EntityId>,
    ) -> Uuid {
        let work_key = work_key.into();
        let mut seen = HashSet::new();
        entity_ids.retain(|id| seen.insert(id.clone()));

        let batch_id = Uuid::now_v7();
        let (done, _) = watch::channel(false);
        let entry = Arc::new(BatchEntry {
            status: RwLock::new(BatchStatus::new(batch_id, work_key.clone(), &entity_ids)),
            done,
        });
        self.batches.insert(batch_id, entry.clone());

        info!(
            batch_id = %batch_id,
            work_key = %work_key,
            entities = entity_ids.len(),
            "Batch submitted"
        );
        tokio::spawn(self.clone().drive(batch_id, work_key, entity_ids, entry));
        batch_id
    }

    /// Returns the current status of a batch.
    #[must_use]
    pub fn get_batch_status(&self, batch_id: Uuid) -> Option<BatchStatus> {
        self.batches
            .get(&batch_id)
            .map(|entry| entry.status.read().clone())
    }

    /// Waits for a batch to finish and returns its final status.
    pub async fn await_batch(&self, batch_id: Uuid) -> Result<BatchStatus, StagegateError> {
        let entry = self
            .batches
            .get(&batch_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StagegateError::not_found("batch", batch_id.to_string()))?;

        let mut done = entry.done.subscribe();
        done.wait_for(|finished| *finished)
            .await
            .map(|_| ())
            .map_err(|_| StagegateError::TransientInfra(format!("batch {batch_id} driver stopped")))?;

        let status = entry.status.read().clone();
        Ok(status)
    }

    /// Submits a batch, waits for it and drops its status.
    pub async fn run_batch(
        self: &Arc<Self>,
        work_key: impl Into<WorkKey>,
        entity_ids: Vec<EntityId>,
    ) -> Result<BatchStatus, StagegateError> {
        let batch_id = self.submit_batch(work_key, entity_ids);
        let status = self.await_batch(batch_id).await;
        self.forget(batch_id);
        status
    }

    /// Drops the status of a finished batch.
    pub fn forget(&self, batch_id: Uuid) -> Option<BatchStatus> {
        self.batches
            .remove(&batch_id)
            .map(|(_, entry)| entry.status.read().clone())
    }

    async fn drive(
        self: Arc<Self>,
        batch_id: Uuid,
        work_key: WorkKey,
        entity_ids: Vec<EntityId>,
        entry: Arc<BatchEntry>,
    ) {
        let timer = SpanTimer::start("batch.run");

        match self.loader.bulk_fetch(&work_key, &entity_ids).await {
            Ok(entries) => {
                debug!(
                    batch_id = %batch_id,
                    entries = entries.len(),
                    "Published batch context"
                );
                self.cache
                    .publish(BatchContext::new(batch_id, work_key.clone(), entries));
            }
            Err(err) => {
                warn!(
                    batch_id = %batch_id,
                    error = %err,
                    "Bulk context fetch failed, workers will fetch individually"
                );
                entry.status.write().bulk_fetch_failed = true;
            }
        }

        let deadline = Instant::now() + self.fan_in_timeout;
        let mut workers = JoinSet::new();
        for (worker_id, entity_id) in entity_ids.into_iter().enumerate() {
            let this = self.clone();
            let work_key = work_key.clone();
            self.pool.spawn(&mut workers, async move {
                let result = this
                    .run_worker(batch_id, worker_id, &work_key, &entity_id)
                    .await;
                (entity_id, result)
            });
        }

        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Ok((entity_id, result)))) => {
                    entry.status.write().record_worker(entity_id, result);
                }
                Ok(Some(Err(join_err))) => {
                    error!(batch_id = %batch_id, error = %join_err, "Batch worker panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        batch_id = %batch_id,
                        remaining = workers.len(),
                        "Fan-in timeout, consolidating available staging areas"
                    );
                    workers.abort_all();
                    // Workers mid-poll may still stage rows; drain before taking staging areas.
                    while let Some(joined) = workers.join_next().await {
                        if let Ok((entity_id, result)) = joined {
                            entry.status.write().record_worker(entity_id, result);
                        }
                    }
                    timed_out = true;
                    break;
                }
            }
        }

        {
            let mut status = entry.status.write();
            let fallback = if timed_out {
                EntityState::TimedOut
            } else {
                EntityState::Failed
            };
            for state in status.entities.values_mut() {
                if *state == EntityState::Pending {
                    *state = fallback;
                }
            }
        }

        let areas = self.staging.take_batch(batch_id);
        let merge = self.consolidator.consolidate(&work_key, &areas).await;
        self.cache.evict(batch_id);

        let snapshot = {
            let mut status = entry.status.write();
            match merge {
                Ok(stats) => status.merge = Some(stats),
                Err(err) => {
                    error!(batch_id = %batch_id, error = %err, "Consolidation failed");
                    status.consolidation_error = Some(err.to_string());
                }
            }
            let degraded = status.consolidation_error.is_some()
                || status.entities.values().any(|state| !state.is_success());
            status.state = if degraded {
                BatchState::Degraded
            } else {
                BatchState::Complete
            };
            status.finished_at = Some(Utc::now());
            status.clone()
        };

        info!(
            batch_id = %batch_id,
            work_key = %work_key,
            state = ?snapshot.state,
            done = snapshot.count(EntityState::Done),
            fallback = snapshot.count(EntityState::FallbackDone),
            failed = snapshot.count(EntityState::Failed),
            timed_out = snapshot.count(EntityState::TimedOut),
            elapsed_ms = timer.finish(),
            "Batch finished"
        );

        if snapshot.state == BatchState::Degraded {
            let detail = snapshot.consolidation_error.clone().unwrap_or_else(|| {
                format!(
                    "{} failed, {} timed out",
                    snapshot.count(EntityState::Failed),
                    snapshot.count(EntityState::TimedOut)
                )
            });
            Alert::new(AlertKind::BatchDegraded, work_key.clone())
                .with_missing(snapshot.unfinished())
                .with_detail(format!("batch {batch_id}: {detail}"))
                .raise(self.alerts.as_ref())
                .await;
        }
        self.alerts
            .emit("batch.completed", serde_json::to_value(&snapshot).ok())
            .await;

        entry.done.send_replace(true);
    }

    async fn run_worker(
        &self,
        batch_id: Uuid,
        worker_id: WorkerId,
        work_key: &WorkKey,
        entity_id: &EntityId,
    ) -> Result<ContextSource, StagegateError> {
        let (context, source) = self
            .cache
            .slice_or_fetch(self.loader.as_ref(), batch_id, work_key, entity_id)
            .await?;
        if source == ContextSource::Fallback {
            debug!(
                batch_id = %batch_id,
                entity = %entity_id,
                "Context cache miss, fetched individually"
            );
        }

        let rows = self
            .processor
            .process(work_key, entity_id, context.as_ref())
            .await?;
        self.staging.write(batch_id, worker_id, rows);
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ConsolidationKey, InMemoryCanonicalStore};
    use crate::events::CollectingEventSink;
    use crate::retry::{JitterStrategy, RetryConfig};
    use crate::testing::{CountingLoader, EchoProcessor, FlakyStore};
    use serde_json::json;

    fn entities(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::new(format!("p{i}"))).collect()
    }

    fn loader_for(ids: &[EntityId]) -> CountingLoader {
        ids.iter().fold(CountingLoader::new(), |loader, id| {
            loader.with_entity(id.as_str(), json!({"avg": 10}))
        })
    }

    fn retry() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new()
                .with_base_delay_ms(10)
                .with_jitter(JitterStrategy::None),
        )
    }

    fn coordinator(
        loader: Arc<CountingLoader>,
        processor: Arc<EchoProcessor>,
        store: Arc<dyn CanonicalStore>,
        config: &BatchConfig,
    ) -> Arc<BatchCoordinator> {
        Arc::new(BatchCoordinator::new(loader, processor, store, retry(), config))
    }

    #[tokio::test]
    async fn test_one_bulk_fetch_for_large_batch() {
        let ids = entities(150);
        let loader = Arc::new(loader_for(&ids));
        let store = Arc::new(InMemoryCanonicalStore::new());
        let coordinator = coordinator(
            loader.clone(),
            Arc::new(EchoProcessor::new()),
            store.clone(),
            &BatchConfig::default(),
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert_eq!(loader.bulk_fetches(), 1);
        assert_eq!(loader.single_fetches(), 0);
        assert_eq!(status.state, BatchState::Complete);
        assert_eq!(status.count(EntityState::Done), 150);
        assert_eq!(store.row_count(&"D".into()).await.unwrap(), 150);
        assert!(coordinator.context_cache().is_empty());
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_individual_fetch() {
        let ids = entities(5);
        let loader = Arc::new(
            loader_for(&ids)
                .with_entity("p3", json!({"avg": 33}))
                .omit_from_bulk("p3"),
        );
        let store = Arc::new(InMemoryCanonicalStore::new());
        let coordinator = coordinator(
            loader.clone(),
            Arc::new(EchoProcessor::new()),
            store.clone(),
            &BatchConfig::default(),
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert_eq!(status.state, BatchState::Complete);
        assert_eq!(status.entities[&EntityId::from("p3")], EntityState::FallbackDone);
        assert_eq!(loader.single_fetches(), 1);
        let row = store
            .get(&ConsolidationKey::new("D", "p3", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["context"], json!({"avg": 33}));
    }

    #[tokio::test]
    async fn test_failed_bulk_fetch_degrades_gracefully() {
        let ids = entities(4);
        let loader = Arc::new(loader_for(&ids).failing_bulk());
        let coordinator = coordinator(
            loader.clone(),
            Arc::new(EchoProcessor::new()),
            Arc::new(InMemoryCanonicalStore::new()),
            &BatchConfig::default(),
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert!(status.bulk_fetch_failed);
        assert_eq!(status.state, BatchState::Complete);
        assert_eq!(status.count(EntityState::FallbackDone), 4);
        assert_eq!(loader.single_fetches(), 4);
    }

    #[tokio::test]
    async fn test_processor_failure_marks_entity_and_degrades() {
        let ids = entities(3);
        let sink = Arc::new(CollectingEventSink::new());
        let coordinator = Arc::new(
            BatchCoordinator::new(
                Arc::new(loader_for(&ids)),
                Arc::new(EchoProcessor::new().failing_for("p1")),
                Arc::new(InMemoryCanonicalStore::new()),
                retry(),
                &BatchConfig::default(),
            )
            .with_alerts(sink.clone()),
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert_eq!(status.state, BatchState::Degraded);
        assert_eq!(status.entities[&EntityId::from("p1")], EntityState::Failed);
        assert!(status.errors.contains_key(&EntityId::from("p1")));
        assert_eq!(sink.count("alert.batch_degraded"), 1);
        assert_eq!(sink.count("batch.completed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_in_timeout_consolidates_partial_output() {
        let ids = entities(6);
        let store = Arc::new(InMemoryCanonicalStore::new());
        let config = BatchConfig::default()
            .with_pool_size(2)
            .with_fan_in_timeout(Duration::from_secs(5));
        let coordinator = coordinator(
            Arc::new(loader_for(&ids)),
            Arc::new(EchoProcessor::new().slow_for("p4", Duration::from_secs(60))),
            store.clone(),
            &config,
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert_eq!(status.state, BatchState::Degraded);
        assert!(status.count(EntityState::TimedOut) >= 1);
        assert_eq!(status.entities[&EntityId::from("p4")], EntityState::TimedOut);
        let staged = store.row_count(&"D".into()).await.unwrap();
        assert_eq!(staged, status.count(EntityState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_finishing_at_fan_in_deadline_leaves_no_staging_behind() {
        let ids = entities(4);
        let store = Arc::new(InMemoryCanonicalStore::new());
        let config = BatchConfig::default()
            .with_pool_size(4)
            .with_fan_in_timeout(Duration::from_secs(5));
        let coordinator = coordinator(
            Arc::new(loader_for(&ids)),
            Arc::new(EchoProcessor::new().slow_for("p2", Duration::from_secs(5))),
            store.clone(),
            &config,
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert!(coordinator.staging.is_empty());
        let staged = store.row_count(&"D".into()).await.unwrap();
        let succeeded =
            status.count(EntityState::Done) + status.count(EntityState::FallbackDone);
        assert_eq!(staged, succeeded);
        assert!(status.entities.values().all(|s| *s != EntityState::Pending));
    }

    #[tokio::test]
    async fn test_run_batch_drops_finished_status() {
        let coordinator = coordinator(
            Arc::new(CountingLoader::new()),
            Arc::new(EchoProcessor::new()),
            Arc::new(InMemoryCanonicalStore::new()),
            &BatchConfig::default(),
        );

        let status = coordinator.run_batch("D", entities(3)).await.unwrap();

        assert_eq!(status.state, BatchState::Complete);
        assert!(coordinator.get_batch_status(status.batch_id).is_none());
        assert!(coordinator.batches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consolidation_conflicts_are_retried() {
        let ids = entities(10);
        let store = Arc::new(FlakyStore::conflicting(1));
        let coordinator = coordinator(
            Arc::new(loader_for(&ids)),
            Arc::new(EchoProcessor::new()),
            store.clone(),
            &BatchConfig::default(),
        );

        let status = coordinator.run_batch("D", ids).await.unwrap();

        assert_eq!(status.state, BatchState::Complete);
        assert_eq!(status.merge.map(|m| m.inserted), Some(10));
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test]
    async fn test_status_lookup() {
        let coordinator = coordinator(
            Arc::new(CountingLoader::new()),
            Arc::new(EchoProcessor::new()),
            Arc::new(InMemoryCanonicalStore::new()),
            &BatchConfig::default(),
        );

        let batch_id = coordinator.submit_batch("D", entities(2));
        assert!(coordinator.get_batch_status(batch_id).is_some());
        let status = coordinator.await_batch(batch_id).await.unwrap();
        assert_eq!(status.batch_id, batch_id);
        assert!(status.finished_at.is_some());

        assert!(coordinator.forget(batch_id).is_some());
        assert!(matches!(
            coordinator.await_batch(batch_id).await,
            Err(StagegateError::NotFound { .. })
        ));
    }
}
