//! Event-driven dependency gate.
//!
//! For each completion of `(stage S, work_key W)` the gate compares the
//! fresh completion set of `S` against the expected set from the reference
//! collaborator and triggers `S+1` once the ratio reaches the configured
//! threshold. No thread ever blocks on the gate: it only accumulates
//! events, a timer per unit forces a degraded advance after `max_wait`,
//! and triggers are deduplicated per `(S+1, W)` and epoch.

mod dependency;
mod ledger;
mod metrics;

mod gate_tests;

pub use dependency::{DependencyGate, GateDecision, HoldReason, ReconcileSummary};
pub use ledger::TriggerLedger;
pub use metrics::{GateMetrics, GateMetricsSnapshot};
