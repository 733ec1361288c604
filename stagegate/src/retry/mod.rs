//! Centralized retry policy.
//!
//! One wrapper parameterized by an injectable error classifier replaces
//! per-call-site retry loops. Transient errors back off exponentially with
//! jitter; permanent errors propagate after a single attempt.

mod executor;
mod policy;

pub use executor::{
    AttemptRecord, DefaultClassifier, ErrorClassifier, GiveUpReason, RetryExecutor, RetryFailure,
};
pub use policy::{BackoffStrategy, JitterStrategy, RetryConfig};
