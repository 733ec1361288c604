//! Completion tracking.
//!
//! Upstream executors report each finished `(stage, work_key, sub_key)`
//! task; the tracker persists it through a [`CompletionStore`] and notifies
//! subscribers. Upserts are idempotent and commutative, so duplicated or
//! reordered events converge to the same state.

mod completion;
mod record;
mod store;

pub use completion::{CompletionTracker, Recorded};
pub use record::{CompletionRecord, UpsertOutcome};
pub use store::{CompletionStore, InMemoryCompletionStore};
