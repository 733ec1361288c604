//! Testing utilities.
//!
//! In-memory stand-ins for every external collaborator the core talks to:
//! - Reference and coverage sources for completeness checks
//! - A collecting trigger bus and a recording stage handler
//! - Batch fixtures (context loader, processor, conflicting store)
//! - Assertions on gate decisions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_already_triggered, assert_triggered, assert_waiting};
pub use fixtures::{CountingLoader, EchoProcessor, FlakyStore};
pub use mocks::{
    CollectingTriggerBus, FailureMode, MapCoverageSource, RecordingHandler, StaticReference,
};
