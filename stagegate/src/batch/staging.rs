//! Per-worker staging areas.

use super::ConsolidationKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Index of a worker within a batch.
pub type WorkerId = usize;

/// One row produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    /// Canonical key the row upserts under.
    pub key: ConsolidationKey,
    /// Row body.
    pub payload: Value,
    /// Later rows win when two workers stage the same key.
    pub staged_at: DateTime<Utc>,
}

impl StagedRow {
    /// Stages `payload` under `key` now.
    #[must_use]
    pub fn new(key: ConsolidationKey, payload: Value) -> Self {
        Self {
            key,
            payload,
            staged_at: Utc::now(),
        }
    }
}

/// The rows written by one worker of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingArea {
    /// Batch the area belongs to.
    pub batch_id: Uuid,
    /// Worker that wrote the area.
    pub worker_id: WorkerId,
    /// Rows in write order.
    pub rows: Vec<StagedRow>,
}

/// Staging areas keyed by `(batch_id, worker_id)`.
///
/// Each worker writes only its own key, so workers never contend.
#[derive(Debug, Default)]
pub struct StagingStore {
    areas: DashMap<(Uuid, WorkerId), StagingArea>,
}

impl StagingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `rows` to the worker's area.
    pub fn write(&self, batch_id: Uuid, worker_id: WorkerId, rows: Vec<StagedRow>) {
        self.areas
            .entry((batch_id, worker_id))
            .or_insert_with(|| StagingArea {
                batch_id,
                worker_id,
                rows: Vec::new(),
            })
            .rows
            .extend(rows);
    }

    /// Removes and returns every area of `batch_id`, ordered by worker.
    pub fn take_batch(&self, batch_id: Uuid) -> Vec<StagingArea> {
        let keys: Vec<_> = self
            .areas
            .iter()
            .filter(|area| area.key().0 == batch_id)
            .map(|area| *area.key())
            .collect();
        let mut areas: Vec<_> = keys
            .into_iter()
            .filter_map(|key| self.areas.remove(&key).map(|(_, area)| area))
            .collect();
        areas.sort_by_key(|area| area.worker_id);
        areas
    }

    /// Number of areas across all batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Returns true if no staging area is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}
