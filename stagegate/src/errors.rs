//! Error types for the stagegate orchestration core.
//!
//! Errors fall into two classes: transient infrastructure failures that are
//! recovered locally (retry, circuit breaker) and permanent data errors that
//! are surfaced immediately with full context.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Classification of an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, rate limits, concurrent-update conflicts. Retried with backoff.
    Transient,
    /// Malformed input, schema violations. Never retried.
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// The main error type for stagegate operations.
#[derive(Debug, Error)]
pub enum StagegateError {
    /// A timeout, rate limit or other recoverable infrastructure failure.
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Malformed input or a schema violation.
    #[error("Permanent data error: {0}")]
    PermanentData(String),

    /// A dependency of a stage could not be reached.
    #[error("Upstream '{resource}' unavailable: {message}")]
    UpstreamUnavailable {
        /// The resource key of the dependency.
        resource: String,
        /// Detail from the failed call.
        message: String,
    },

    /// The circuit breaker for a resource rejected the call.
    #[error("Circuit open for resource '{resource}' (cooldown remaining: {remaining_ms}ms)")]
    CircuitOpen {
        /// The resource key.
        resource: String,
        /// Milliseconds until a half-open trial is allowed.
        remaining_ms: u64,
    },

    /// The reference collaborator could not resolve an expected set.
    #[error("Reference unavailable: {0}")]
    ReferenceUnavailable(String),

    /// Another writer updated the destination partition concurrently.
    #[error("Concurrent update conflict on partition '{partition}'")]
    ConsolidationConflict {
        /// The destination partition.
        partition: String,
    },

    /// The overall retry deadline elapsed.
    #[error("Deadline of {deadline_ms}ms exceeded after {attempts} attempt(s)")]
    DeadlineExceeded {
        /// The configured deadline.
        deadline_ms: u64,
        /// Attempts made before the deadline.
        attempts: usize,
    },

    /// All retry attempts failed with a transient error.
    #[error("{error} (after {attempts} attempt(s))")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
        /// The terminal error.
        error: Box<StagegateError>,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A referenced entity does not exist.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// What was looked up (e.g. "stage", "batch").
        kind: &'static str,
        /// The lookup key.
        key: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StagegateError {
    /// Creates an upstream unavailable error.
    #[must_use]
    pub fn upstream(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Returns the default classification of this error.
    ///
    /// A circuit-open rejection is permanent for the current call.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientInfra(_)
            | Self::UpstreamUnavailable { .. }
            | Self::ReferenceUnavailable(_)
            | Self::ConsolidationConflict { .. }
            | Self::Io(_) => ErrorClass::Transient,
            Self::Exhausted { error, .. } => error.class(),
            Self::PermanentData(_)
            | Self::CircuitOpen { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Config(_)
            | Self::NotFound { .. }
            | Self::Serialization(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if the error indicates an unreachable dependency.
    #[must_use]
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { .. } | Self::TransientInfra(_) | Self::Io(_) => true,
            Self::Exhausted { error, .. } => error.is_upstream_failure(),
            _ => false,
        }
    }

    /// Returns a short, stable name for the error variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientInfra(_) => "TransientInfra",
            Self::PermanentData(_) => "PermanentData",
            Self::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::ReferenceUnavailable(_) => "ReferenceUnavailable",
            Self::ConsolidationConflict { .. } => "ConsolidationConflict",
            Self::DeadlineExceeded { .. } => "DeadlineExceeded",
            Self::Exhausted { .. } => "Exhausted",
            Self::Config(_) => "Config",
            Self::NotFound { .. } => "NotFound",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        }
    }

    /// Converts to a dictionary representation for alert payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("class".to_string(), serde_json::json!(self.class().to_string()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::UpstreamUnavailable { resource, .. } | Self::CircuitOpen { resource, .. } => {
                map.insert("resource".to_string(), serde_json::json!(resource));
            }
            Self::ConsolidationConflict { partition } => {
                map.insert("partition".to_string(), serde_json::json!(partition));
            }
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => {
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            _ => {}
        }

        map
    }
}

impl From<serde_json::Error> for StagegateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
