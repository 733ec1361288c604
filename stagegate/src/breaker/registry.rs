//! Per-resource breaker registry.

use super::{BreakerSnapshot, CircuitBreaker};
use crate::config::BreakerConfig;
use dashmap::DashMap;
use std::sync::Arc;

/// Lazily creates one breaker per resource key.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates an empty registry whose breakers share `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `resource_key`, creating it if needed.
    pub fn get_or_create(&self, resource_key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(resource_key) {
            return existing.clone();
        }
        self.breakers
            .entry(resource_key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(resource_key, &self.config)))
            .clone()
    }

    /// Returns the breaker for `resource_key` if one exists.
    #[must_use]
    pub fn get(&self, resource_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(resource_key).map(|b| b.clone())
    }

    /// Returns snapshots of all breakers, sorted by resource key.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        snapshots
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
