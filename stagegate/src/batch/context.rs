//! Shared batch context.

use crate::core::{EntityId, WorkKey};
use crate::errors::StagegateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Pre-fetched reference data for one batch, indexed by entity.
///
/// Immutable once published; workers read it without locking.
#[derive(Debug, Clone)]
pub struct BatchContext {
    batch_id: Uuid,
    work_key: WorkKey,
    entries: HashMap<EntityId, Value>,
    loaded_at: DateTime<Utc>,
}

impl BatchContext {
    /// Freezes the bulk-fetched entries of one batch.
    #[must_use]
    pub fn new(batch_id: Uuid, work_key: WorkKey, entries: HashMap<EntityId, Value>) -> Self {
        Self {
            batch_id,
            work_key,
            entries,
            loaded_at: Utc::now(),
        }
    }

    /// Owning batch.
    #[must_use]
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Partition the context was loaded for.
    #[must_use]
    pub fn work_key(&self) -> &WorkKey {
        &self.work_key
    }

    /// When the bulk fetch completed.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Returns the slice for `entity_id`.
    #[must_use]
    pub fn get(&self, entity_id: &EntityId) -> Option<&Value> {
        self.entries.get(entity_id)
    }

    /// Number of entities with context.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bulk fetch returned nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fetches historical context for entities.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    /// One round trip for every entity of a batch. Entities without
    /// context may be absent from the result.
    async fn bulk_fetch(
        &self,
        work_key: &WorkKey,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Value>, StagegateError>;

    /// Fallback fetch for one entity.
    async fn fetch_one(
        &self,
        work_key: &WorkKey,
        entity_id: &EntityId,
    ) -> Result<Option<Value>, StagegateError>;
}

/// Where a worker got its context from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    /// The shared batch context.
    Shared,
    /// An individual fallback fetch.
    Fallback,
}

/// Published batch contexts, keyed by batch id.
#[derive(Debug, Default)]
pub struct ContextCache {
    contexts: DashMap<Uuid, Arc<BatchContext>>,
}

impl ContextCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a context, replacing any previous one for the batch.
    pub fn publish(&self, context: BatchContext) -> Arc<BatchContext> {
        let context = Arc::new(context);
        self.contexts.insert(context.batch_id(), context.clone());
        context
    }

    /// Returns the published context of a batch.
    #[must_use]
    pub fn get(&self, batch_id: Uuid) -> Option<Arc<BatchContext>> {
        self.contexts.get(&batch_id).map(|c| c.clone())
    }

    /// Drops the context of a consolidated batch.
    pub fn evict(&self, batch_id: Uuid) -> bool {
        self.contexts.remove(&batch_id).is_some()
    }

    /// Number of published contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if no context is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Reads an entity's slice from the shared context, falling back to an
    /// individual fetch on a miss.
    pub async fn slice_or_fetch(
        &self,
        loader: &dyn ContextLoader,
        batch_id: Uuid,
        work_key: &WorkKey,
        entity_id: &EntityId,
    ) -> Result<(Option<Value>, ContextSource), StagegateError> {
        let shared = self
            .get(batch_id)
            .and_then(|context| context.get(entity_id).cloned());
        if let Some(value) = shared {
            return Ok((Some(value), ContextSource::Shared));
        }
        let fetched = loader.fetch_one(work_key, entity_id).await?;
        Ok((fetched, ContextSource::Fallback))
    }
}
