//! Batch context loading and bounded fan-out.
//!
//! A batch loads the historical context of all its entities in one bulk
//! round trip, shares it read-only with a bounded pool of workers, and
//! merges the workers' staging areas into the canonical store under a
//! per-partition single-writer token:
//!
//! - [`ContextCache`] holds the shared context; a miss falls back to an
//!   individual fetch
//! - [`StagingStore`] keeps each worker's rows apart until fan-in
//! - [`Consolidator`] deduplicates by [`ConsolidationKey`] and upserts
//! - [`BatchCoordinator`] drives the whole lifecycle and reports status

mod consolidate;
mod context;
mod coordinator;
mod keys;
mod pool;
mod staging;
mod store;

pub use consolidate::Consolidator;
pub use context::{BatchContext, ContextCache, ContextLoader, ContextSource};
pub use coordinator::{BatchCoordinator, BatchState, BatchStatus, EntityProcessor, EntityState};
pub use keys::{ConsolidationKey, VariantId};
pub use pool::WorkerPool;
pub use staging::{StagedRow, StagingArea, StagingStore, WorkerId};
pub use store::{CanonicalStore, InMemoryCanonicalStore, MergeStats};
