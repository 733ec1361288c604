//! Cheap dependency probes.

use async_trait::async_trait;
use std::fmt;

/// An O(1) existence check against the dependency a caller needs.
///
/// Probes run on every call while a breaker is open, so they must be
/// inexpensive (a key lookup, a HEAD request), never a full fetch.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns true if the dependency is available.
    async fn probe(&self) -> bool;
}

/// A probe that never succeeds; recovery relies on the half-open trial.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverProbe;

#[async_trait]
impl Probe for NeverProbe {
    async fn probe(&self) -> bool {
        false
    }
}

/// A probe backed by a synchronous closure.
pub struct FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    check: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    /// Creates a new closure probe.
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

impl<F> fmt::Debug for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").finish()
    }
}

#[async_trait]
impl<F> Probe for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn probe(&self) -> bool {
        (self.check)()
    }
}
