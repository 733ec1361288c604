//! Auto-resetting circuit breaker.
//!
//! A breaker opens after a run of consecutive failures against one
//! resource. While open, each call first runs a cheap [`Probe`]; a
//! successful probe closes the breaker immediately instead of waiting for
//! the cooldown. Without a successful probe the breaker allows a single
//! half-open trial once the cooldown has elapsed, doubling the cooldown
//! (up to a cap) if the trial fails.

mod circuit;
mod probe;
mod registry;

pub use circuit::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use probe::{FnProbe, NeverProbe, Probe};
pub use registry::BreakerRegistry;
