//! Assertions on gate decisions.

use crate::core::{TriggerEvent, TriggerReason};
use crate::gate::GateDecision;

/// Asserts that the gate published a trigger with `reason` and returns it.
pub fn assert_triggered(decision: &GateDecision, reason: TriggerReason) -> &TriggerEvent {
    match decision {
        GateDecision::Triggered(trigger) => {
            assert_eq!(
                trigger.trigger_reason, reason,
                "Expected a {reason} trigger, got {}",
                trigger.trigger_reason
            );
            trigger
        }
        other => panic!("Expected a {reason} trigger, got {other:?}"),
    }
}

/// Asserts that the gate is waiting with `completed` of `expected` done.
pub fn assert_waiting(decision: &GateDecision, completed: usize, expected: usize) {
    assert_eq!(
        decision,
        &GateDecision::Waiting {
            completed,
            expected
        },
        "Expected gate to wait at {completed}/{expected}"
    );
}

/// Asserts that the gate suppressed a duplicate trigger.
pub fn assert_already_triggered(decision: &GateDecision) {
    assert!(
        matches!(decision, GateDecision::AlreadyTriggered(_)),
        "Expected a suppressed duplicate, got {decision:?}"
    );
}
