//! # Stagegate
//!
//! The orchestration core of a staged data pipeline: it decides when a
//! stage may advance to the next one, protects stages from failing
//! dependencies, checks that each stage really produced complete output,
//! and fans batches of work out to a bounded pool of workers sharing one
//! read-only context.
//!
//! - **Completion tracking**: idempotent, order-tolerant per-sub-unit records
//! - **Dependency gate**: event-driven triggers with threshold, `max_wait`
//!   forcing, epoch deduplication and top-up reconciliation
//! - **Retry and circuit breaking**: classified backoff and auto-resetting
//!   breakers keyed by upstream resource
//! - **Completeness validation**: multi-source coverage against a reference
//! - **Batch fan-out**: one bulk context load, staged writes, idempotent
//!   consolidation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagegate::prelude::*;
//!
//! let registry = StageRegistry::builder()
//!     .stage("ingest", ingest_handler)?
//!     .stage("aggregate", aggregate_handler)?
//!     .build()?;
//!
//! let (bus, triggers) = ChannelTriggerBus::new(64);
//! let orchestrator = Orchestrator::builder(registry, reference, Arc::new(bus))
//!     .config(OrchestratorConfig::from_file("stagegate.json")?)
//!     .build()?;
//!
//! let (events_tx, events_rx) = tokio::sync::mpsc::channel(1024);
//! let _tasks = orchestrator.start(events_rx, triggers);
//! events_tx.send(CompletionEvent::success("ingest", "2024-11-02", "game-1", 412)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod breaker;
pub mod completeness;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod gate;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod testing;
pub mod tracker;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{
        BatchCoordinator, BatchState, BatchStatus, CanonicalStore, ConsolidationKey,
        ContextLoader, EntityProcessor, EntityState, StagedRow,
    };
    pub use crate::breaker::{BreakerRegistry, BreakerState, CircuitBreaker, Probe};
    pub use crate::completeness::{
        CompletenessResult, CompletenessStatus, CompletenessValidator, CoverageSource,
        ReferenceProvider,
    };
    pub use crate::config::{
        BatchConfig, BreakerConfig, CompletenessConfig, GateConfig, OrchestratorConfig,
    };
    pub use crate::core::{
        CompletionEvent, EntityId, StageId, StageOutcome, SubKey, TaskStatus, TriggerEvent,
        TriggerReason, WorkKey,
    };
    pub use crate::errors::{ErrorClass, StagegateError};
    pub use crate::events::{
        Alert, AlertKind, ChannelTriggerBus, EventSink, LoggingEventSink, NoOpEventSink,
        TriggerBus,
    };
    pub use crate::gate::{DependencyGate, GateDecision};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::registry::{StageHandler, StageInvocation, StageRegistry};
    pub use crate::retry::{RetryConfig, RetryExecutor};
    pub use crate::tracker::{CompletionStore, CompletionTracker};
}
