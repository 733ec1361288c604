//! Stage registry.
//!
//! Maps each tagged stage identifier to the handler that executes it and
//! resolves the stage that follows it. The registry is built once at
//! startup and is immutable afterwards.

use crate::core::{StageId, StageOutcome, SubKey, WorkKey};
use crate::errors::StagegateError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One execution request for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageInvocation {
    /// Stage being invoked.
    pub stage: StageId,
    /// Work unit being advanced.
    pub work_key: WorkKey,
    /// Sub-unit this call is responsible for.
    pub sub_key: SubKey,
}

impl StageInvocation {
    /// Creates an invocation.
    #[must_use]
    pub fn new(
        stage: impl Into<StageId>,
        work_key: impl Into<WorkKey>,
        sub_key: impl Into<SubKey>,
    ) -> Self {
        Self {
            stage: stage.into(),
            work_key: work_key.into(),
            sub_key: sub_key.into(),
        }
    }
}

impl fmt::Display for StageInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}/{}]", self.stage, self.work_key, self.sub_key)
    }
}

/// The capability that executes one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Runs the stage for one sub-unit and reports what it produced.
    async fn invoke(&self, invocation: &StageInvocation) -> Result<StageOutcome, StagegateError>;

    /// The upstream resource the invocation depends on; one circuit
    /// breaker exists per resource key.
    fn resource_key(&self, invocation: &StageInvocation) -> String {
        invocation.stage.to_string()
    }

    /// Cheap existence check for the invocation's dependency, consulted
    /// while its breaker is open.
    async fn probe(&self, _invocation: &StageInvocation) -> bool {
        false
    }
}

/// Immutable stage-to-handler registry.
#[derive(Clone)]
pub struct StageRegistry {
    handlers: HashMap<StageId, Arc<dyn StageHandler>>,
    order: Vec<StageId>,
    successors: HashMap<StageId, StageId>,
    terminal: HashSet<StageId>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("order", &self.order)
            .field("successors", &self.successors)
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl StageRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// Returns the handler for `stage`.
    pub fn handler(&self, stage: &StageId) -> Result<Arc<dyn StageHandler>, StagegateError> {
        self.handlers
            .get(stage)
            .cloned()
            .ok_or_else(|| StagegateError::not_found("stage", stage.as_str()))
    }

    /// Returns the stage that runs after `stage`, or `None` for a terminal
    /// or unknown stage.
    #[must_use]
    pub fn next_stage(&self, stage: &StageId) -> Option<StageId> {
        if self.terminal.contains(stage) {
            return None;
        }
        if let Some(next) = self.successors.get(stage) {
            return Some(next.clone());
        }
        let position = self.order.iter().position(|s| s == stage)?;
        self.order.get(position + 1).cloned()
    }

    /// Returns true if `stage` is registered.
    #[must_use]
    pub fn contains(&self, stage: &StageId) -> bool {
        self.handlers.contains_key(stage)
    }

    /// Registered stages in registration order.
    #[must_use]
    pub fn stages(&self) -> &[StageId] {
        &self.order
    }
}

/// Builder for [`StageRegistry`].
#[derive(Default)]
pub struct StageRegistryBuilder {
    handlers: HashMap<StageId, Arc<dyn StageHandler>>,
    order: Vec<StageId>,
    successors: HashMap<StageId, StageId>,
    terminal: HashSet<StageId>,
}

impl fmt::Debug for StageRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistryBuilder")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl StageRegistryBuilder {
    /// Registers a stage. Stages follow one another in registration order
    /// unless [`successor`](Self::successor) says otherwise.
    ///
    /// # Errors
    ///
    /// Returns `StagegateError::Config` if the stage is already registered.
    pub fn stage(
        mut self,
        stage: impl Into<StageId>,
        handler: Arc<dyn StageHandler>,
    ) -> Result<Self, StagegateError> {
        let stage = stage.into();
        if self.handlers.contains_key(&stage) {
            return Err(StagegateError::Config(format!(
                "stage '{stage}' registered twice"
            )));
        }
        self.order.push(stage.clone());
        self.handlers.insert(stage, handler);
        Ok(self)
    }

    /// Overrides the stage that follows `from`.
    #[must_use]
    pub fn successor(mut self, from: impl Into<StageId>, to: impl Into<StageId>) -> Self {
        self.successors.insert(from.into(), to.into());
        self
    }

    /// Marks `stage` as having no successor.
    #[must_use]
    pub fn terminal(mut self, stage: impl Into<StageId>) -> Self {
        self.terminal.insert(stage.into());
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns `StagegateError::Config` if a successor or terminal marker
    /// names an unknown stage, or if successors form a cycle.
    pub fn build(self) -> Result<StageRegistry, StagegateError> {
        for (from, to) in &self.successors {
            for stage in [from, to] {
                if !self.handlers.contains_key(stage) {
                    return Err(StagegateError::Config(format!(
                        "successor '{from}' -> '{to}' names unknown stage '{stage}'"
                    )));
                }
            }
        }
        if let Some(stage) = self.terminal.iter().find(|s| !self.handlers.contains_key(*s)) {
            return Err(StagegateError::Config(format!(
                "terminal marker names unknown stage '{stage}'"
            )));
        }

        let registry = StageRegistry {
            handlers: self.handlers,
            order: self.order,
            successors: self.successors,
            terminal: self.terminal,
        };

        for start in &registry.order {
            let mut seen = HashSet::from([start.clone()]);
            let mut current = start.clone();
            while let Some(next) = registry.next_stage(&current) {
                if !seen.insert(next.clone()) {
                    return Err(StagegateError::Config(format!(
                        "stage chain starting at '{start}' loops back to '{next}'"
                    )));
                }
                current = next;
            }
        }

        Ok(registry)
    }
}
