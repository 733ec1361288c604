//! In-memory collaborators for gate, completeness and orchestrator tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::completeness::{CoverageSource, ReferenceProvider};
use crate::core::{StageId, StageOutcome, SubKey, TriggerEvent, TriggerReason, WorkKey};
use crate::errors::StagegateError;
use crate::events::TriggerBus;
use crate::registry::{StageHandler, StageInvocation};

/// A reference service backed by a map.
///
/// Unknown `(stage, work_key)` pairs resolve to an empty expected set.
#[derive(Debug)]
pub struct StaticReference {
    expected: Mutex<HashMap<(StageId, WorkKey), BTreeSet<SubKey>>>,
    failing: Mutex<HashSet<WorkKey>>,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl Default for StaticReference {
    fn default() -> Self {
        Self {
            expected: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

impl StaticReference {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the expected set for `(stage, work_key)`.
    #[must_use]
    pub fn with_expected<I, S>(self, stage: &str, work_key: &str, sub_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubKey>,
    {
        self.set_expected(stage, work_key, sub_keys);
        self
    }

    /// Replaces the expected set for `(stage, work_key)`.
    pub fn set_expected<I, S>(&self, stage: &str, work_key: &str, sub_keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SubKey>,
    {
        self.expected.lock().insert(
            (StageId::from(stage), WorkKey::from(work_key)),
            sub_keys.into_iter().map(Into::into).collect(),
        );
    }

    /// Makes every lookup fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes lookups for one work key fail.
    pub fn fail_for(&self, work_key: &str) {
        self.failing.lock().insert(WorkKey::from(work_key));
    }

    /// Number of lookups so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceProvider for StaticReference {
    async fn expected_sub_units(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<BTreeSet<SubKey>, StagegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) || self.failing.lock().contains(work_key) {
            return Err(StagegateError::ReferenceUnavailable(format!(
                "schedule lookup for {stage}/{work_key} failed"
            )));
        }
        Ok(self
            .expected
            .lock()
            .get(&(stage.clone(), work_key.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

/// A coverage source with fixed per-entity signal counts.
#[derive(Debug, Clone)]
pub struct MapCoverageSource {
    id: String,
    signals: HashMap<SubKey, u64>,
    available: bool,
}

impl MapCoverageSource {
    /// Creates an available source with no signals.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            signals: HashMap::new(),
            available: true,
        }
    }

    /// Reports `count` signals for `entity`.
    #[must_use]
    pub fn with_signals(mut self, entity: &str, count: u64) -> Self {
        self.signals.insert(SubKey::from(entity), count);
        self
    }

    /// Makes every query fail.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

#[async_trait]
impl CoverageSource for MapCoverageSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn signal_counts(
        &self,
        _work_key: &WorkKey,
        entities: &BTreeSet<SubKey>,
    ) -> Result<HashMap<SubKey, u64>, StagegateError> {
        if !self.available {
            return Err(StagegateError::upstream(&self.id, "source offline"));
        }
        Ok(self
            .signals
            .iter()
            .filter(|(entity, _)| entities.contains(*entity))
            .map(|(entity, count)| (entity.clone(), *count))
            .collect())
    }
}

/// A trigger bus that keeps every published trigger.
#[derive(Debug, Default)]
pub struct CollectingTriggerBus {
    triggers: Mutex<Vec<TriggerEvent>>,
    failing: AtomicBool,
}

impl CollectingTriggerBus {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all triggers published so far.
    #[must_use]
    pub fn triggers(&self) -> Vec<TriggerEvent> {
        self.triggers.lock().clone()
    }

    /// Returns the triggers published with `reason`.
    #[must_use]
    pub fn with_reason(&self, reason: TriggerReason) -> Vec<TriggerEvent> {
        self.triggers
            .lock()
            .iter()
            .filter(|t| t.trigger_reason == reason)
            .cloned()
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.lock().is_empty()
    }

    /// Makes publishing fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TriggerBus for CollectingTriggerBus {
    async fn publish(&self, trigger: TriggerEvent) -> Result<(), StagegateError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StagegateError::TransientInfra("bus unreachable".into()));
        }
        self.triggers.lock().push(trigger);
        Ok(())
    }
}

/// How a [`RecordingHandler`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// `TransientInfra`.
    Transient,
    /// `UpstreamUnavailable` for the handler's resource.
    Unavailable,
    /// `PermanentData`.
    Permanent,
}

/// A stage handler that records invocations.
///
/// Succeeds with ten rows unless configured otherwise.
#[derive(Debug)]
pub struct RecordingHandler {
    outcome: Mutex<StageOutcome>,
    resource: Option<String>,
    failure: Mutex<Option<(FailureMode, usize)>>,
    healthy: AtomicBool,
    invocations: Mutex<Vec<StageInvocation>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(StageOutcome::from_counts(10, 10)),
            resource: None,
            failure: Mutex::new(None),
            healthy: AtomicBool::new(true),
            invocations: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingHandler {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `outcome` from every successful invocation.
    #[must_use]
    pub fn with_outcome(self, outcome: StageOutcome) -> Self {
        *self.outcome.lock() = outcome;
        self
    }

    /// Reports `resource` as the breaker key.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Fails the next `times` invocations.
    #[must_use]
    pub fn failing_first(self, times: usize, mode: FailureMode) -> Self {
        *self.failure.lock() = Some((mode, times));
        self
    }

    /// Fails every invocation and reports the dependency as down to probes.
    #[must_use]
    pub fn failing_always(self, mode: FailureMode) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self.failing_first(usize::MAX, mode)
    }

    /// Stops failing and reports the dependency as up.
    pub fn recover(&self) {
        *self.failure.lock() = None;
        self.healthy.store(true, Ordering::SeqCst);
    }

    /// Invocations received so far, including failed ones.
    #[must_use]
    pub fn invocations(&self) -> Vec<StageInvocation> {
        self.invocations.lock().clone()
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.invocations.lock().len()
    }

    fn next_failure(&self, invocation: &StageInvocation) -> Option<StagegateError> {
        let mut failure = self.failure.lock();
        let (mode, remaining) = failure.as_mut()?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        let err = match mode {
            FailureMode::Transient => StagegateError::TransientInfra(format!("{invocation} timed out")),
            FailureMode::Unavailable => {
                StagegateError::upstream(self.resource_key(invocation), "connection refused")
            }
            FailureMode::Permanent => StagegateError::PermanentData(format!("{invocation} malformed")),
        };
        Some(err)
    }
}

#[async_trait]
impl StageHandler for RecordingHandler {
    async fn invoke(&self, invocation: &StageInvocation) -> Result<StageOutcome, StagegateError> {
        self.invocations.lock().push(invocation.clone());
        if let Some(err) = self.next_failure(invocation) {
            return Err(err);
        }
        Ok(self.outcome.lock().clone())
    }

    fn resource_key(&self, invocation: &StageInvocation) -> String {
        self.resource
            .clone()
            .unwrap_or_else(|| invocation.stage.to_string())
    }

    async fn probe(&self, _invocation: &StageInvocation) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
