//! Core domain model types for stagegate.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Typed identifiers for stages, work units, sub-units and entities
//! - Task status and trigger reason enums
//! - Completion and trigger events
//! - The explicit stage outcome type

mod event;
mod ids;
mod outcome;
mod status;

pub use event::{completion_ratio, CompletionEvent, TriggerEvent};
pub use ids::{EntityId, StageId, SubKey, WorkKey};
pub use outcome::{OutcomeClass, StageOutcome};
pub use status::{TaskStatus, TriggerReason};
