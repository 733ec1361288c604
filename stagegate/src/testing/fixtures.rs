//! Batch-side fixtures: a counting context loader, an echoing processor
//! and a store that raises write conflicts.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::batch::{
    CanonicalStore, ConsolidationKey, ContextLoader, EntityProcessor, InMemoryCanonicalStore,
    MergeStats, StagedRow,
};
use crate::core::{EntityId, WorkKey};
use crate::errors::StagegateError;

/// A context loader that counts its round trips.
#[derive(Debug, Default)]
pub struct CountingLoader {
    entries: HashMap<EntityId, Value>,
    omitted: HashSet<EntityId>,
    fail_bulk: bool,
    bulk_fetches: AtomicUsize,
    single_fetches: AtomicUsize,
}

impl CountingLoader {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the context of one entity.
    #[must_use]
    pub fn with_entity(mut self, entity: &str, context: Value) -> Self {
        self.entries.insert(EntityId::from(entity), context);
        self
    }

    /// Leaves `entity` out of bulk results so workers miss the cache.
    #[must_use]
    pub fn omit_from_bulk(mut self, entity: &str) -> Self {
        self.omitted.insert(EntityId::from(entity));
        self
    }

    /// Makes the bulk fetch fail.
    #[must_use]
    pub fn failing_bulk(mut self) -> Self {
        self.fail_bulk = true;
        self
    }

    /// Bulk fetches so far.
    #[must_use]
    pub fn bulk_fetches(&self) -> usize {
        self.bulk_fetches.load(Ordering::SeqCst)
    }

    /// Individual fallback fetches so far.
    #[must_use]
    pub fn single_fetches(&self) -> usize {
        self.single_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextLoader for CountingLoader {
    async fn bulk_fetch(
        &self,
        _work_key: &WorkKey,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Value>, StagegateError> {
        self.bulk_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_bulk {
            return Err(StagegateError::TransientInfra("history query timed out".into()));
        }
        Ok(entity_ids
            .iter()
            .filter(|id| !self.omitted.contains(*id))
            .filter_map(|id| self.entries.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn fetch_one(
        &self,
        _work_key: &WorkKey,
        entity_id: &EntityId,
    ) -> Result<Option<Value>, StagegateError> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(entity_id).cloned())
    }
}

/// Stages one row per entity echoing the context it saw.
#[derive(Debug, Default)]
pub struct EchoProcessor {
    failing: HashSet<EntityId>,
    slow: HashMap<EntityId, Duration>,
}

impl EchoProcessor {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails processing of `entity` with a data error.
    #[must_use]
    pub fn failing_for(mut self, entity: &str) -> Self {
        self.failing.insert(EntityId::from(entity));
        self
    }

    /// Delays processing of `entity` by `delay`.
    #[must_use]
    pub fn slow_for(mut self, entity: &str, delay: Duration) -> Self {
        self.slow.insert(EntityId::from(entity), delay);
        self
    }
}

#[async_trait]
impl EntityProcessor for EchoProcessor {
    async fn process(
        &self,
        work_key: &WorkKey,
        entity_id: &EntityId,
        context: Option<&Value>,
    ) -> Result<Vec<StagedRow>, StagegateError> {
        if let Some(delay) = self.slow.get(entity_id) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(entity_id) {
            return Err(StagegateError::PermanentData(format!(
                "no features for {entity_id}"
            )));
        }
        let key = ConsolidationKey::new(work_key.clone(), entity_id.clone(), None);
        let payload = json!({
            "entity": entity_id.as_str(),
            "context": context.cloned().unwrap_or(Value::Null),
        });
        Ok(vec![StagedRow::new(key, payload)])
    }
}

/// A canonical store that reports a write conflict on its first calls.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryCanonicalStore,
    conflicts_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    /// Conflicts on the first `times` upserts.
    #[must_use]
    pub fn conflicting(times: usize) -> Self {
        Self {
            inner: InMemoryCanonicalStore::new(),
            conflicts_left: AtomicUsize::new(times),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Upserts attempted so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CanonicalStore for FlakyStore {
    async fn upsert_rows(
        &self,
        partition: &WorkKey,
        rows: &[StagedRow],
    ) -> Result<MergeStats, StagegateError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let conflict = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(StagegateError::ConsolidationConflict {
                partition: partition.to_string(),
            });
        }
        self.inner.upsert_rows(partition, rows).await
    }

    async fn row_count(&self, partition: &WorkKey) -> Result<usize, StagegateError> {
        self.inner.row_count(partition).await
    }

    async fn get(&self, key: &ConsolidationKey) -> Result<Option<Value>, StagegateError> {
        self.inner.get(key).await
    }
}
