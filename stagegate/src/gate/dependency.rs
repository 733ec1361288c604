//! The dependency gate.

use super::{GateMetrics, GateMetricsSnapshot, TriggerLedger};
use crate::completeness::{CompletenessStatus, CompletenessValidator, ReferenceProvider};
use crate::config::GateConfig;
use crate::core::{completion_ratio, StageId, SubKey, TriggerEvent, TriggerReason, WorkKey};
use crate::errors::StagegateError;
use crate::events::{Alert, AlertKind, EventSink, LoggingEventSink, TriggerBus};
use crate::observability::SpanTimer;
use crate::registry::StageRegistry;
use crate::tracker::{CompletionRecord, CompletionTracker};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What the gate decided for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// The stage has no successor.
    Terminal,
    /// Not enough sub-units are complete yet.
    Waiting {
        completed: usize,
        expected: usize,
    },
    /// A trigger was published.
    Triggered(TriggerEvent),
    /// The next stage was already triggered in this epoch.
    AlreadyTriggered(TriggerReason),
    /// The gate cannot advance yet.
    Held(HoldReason),
}

/// Why the gate is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// The expected set could not be resolved.
    ReferenceUnavailable,
    /// Event-triggered validation reported FAILED and blocking is enabled.
    ValidationFailed,
}

/// Counts from one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Tracked units looked at.
    pub examined: usize,
    /// Full triggers fired for units that had not fired yet.
    pub triggered: usize,
    /// Units force-advanced after `max_wait`.
    pub forced: usize,
    /// Forced units re-triggered as full in a new epoch.
    pub topped_up: usize,
    /// Units whose expected set could not be resolved.
    pub stalled: usize,
    /// Units dropped after falling out of the freshness window.
    pub retired: usize,
}

struct Evaluation {
    expected: BTreeSet<SubKey>,
    completed: BTreeSet<SubKey>,
}

impl Evaluation {
    fn ratio(&self) -> f64 {
        completion_ratio(self.completed.len(), self.expected.len())
    }

    fn is_complete(&self) -> bool {
        self.completed.len() == self.expected.len()
    }

    fn missing(&self) -> Vec<SubKey> {
        self.expected.difference(&self.completed).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct TrackedUnit {
    timer: Option<AbortHandle>,
    armed_at: Option<Instant>,
    expired: bool,
    stalled: bool,
    validation: Option<CompletenessStatus>,
}

type UnitKey = (StageId, WorkKey);

/// Decides when a stage's successor may run for a work unit.
///
/// Evaluation is driven by completion events; a per-`(stage, work_key)`
/// timer forces a partial advance after `max_wait`, and a periodic
/// reconciliation sweep tops up forced triggers once stragglers arrive.
pub struct DependencyGate {
    registry: Arc<StageRegistry>,
    tracker: Arc<CompletionTracker>,
    reference: Arc<dyn ReferenceProvider>,
    validators: HashMap<StageId, Arc<CompletenessValidator>>,
    bus: Arc<dyn TriggerBus>,
    alerts: Arc<dyn EventSink>,
    config: GateConfig,
    ledger: TriggerLedger,
    tracked: DashMap<UnitKey, TrackedUnit>,
    metrics: GateMetrics,
}

impl std::fmt::Debug for DependencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGate")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

impl DependencyGate {
    /// Creates a gate. Alerts go to a [`LoggingEventSink`] until
    /// [`with_alerts`](Self::with_alerts) replaces it.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        tracker: Arc<CompletionTracker>,
        reference: Arc<dyn ReferenceProvider>,
        bus: Arc<dyn TriggerBus>,
        config: GateConfig,
    ) -> Self {
        Self {
            registry,
            tracker,
            reference,
            validators: HashMap::new(),
            bus,
            alerts: Arc::new(LoggingEventSink::default()),
            config,
            ledger: TriggerLedger::new(),
            tracked: DashMap::new(),
            metrics: GateMetrics::default(),
        }
    }

    /// Sets the alert sink.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn EventSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Runs `validator` as soon as every expected sub-unit of its stage is
    /// complete for a work unit.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<CompletenessValidator>) -> Self {
        self.validators.insert(validator.stage().clone(), validator);
        self
    }

    /// Returns the trigger ledger.
    #[must_use]
    pub fn ledger(&self) -> &TriggerLedger {
        &self.ledger
    }

    /// Returns the gate counters.
    #[must_use]
    pub fn metrics(&self) -> GateMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of `(stage, work_key)` units still tracked.
    #[must_use]
    pub fn tracked_units(&self) -> usize {
        self.tracked.len()
    }

    /// Evaluates the gate after `record` was stored.
    ///
    /// Arms the `max_wait` timer on the first record of a unit. A reference
    /// outage holds the gate rather than failing; tracker and bus errors
    /// propagate.
    pub async fn on_completion(
        self: &Arc<Self>,
        record: &CompletionRecord,
    ) -> Result<GateDecision, StagegateError> {
        let stage = &record.stage;
        let work_key = &record.work_key;
        let Some(next) = self.registry.next_stage(stage) else {
            return Ok(GateDecision::Terminal);
        };

        let fired = self.ledger.fired(&next, work_key);
        if fired.is_none() {
            self.arm_timer(stage, work_key);
        }
        if let Some(reason) = fired {
            if !self.wants_validation(stage, work_key) {
                self.metrics.record_duplicate();
                return Ok(GateDecision::AlreadyTriggered(reason));
            }
        }

        let timer = SpanTimer::start("gate.evaluate");
        let expected = match self.reference.expected_sub_units(stage, work_key).await {
            Ok(expected) => expected,
            Err(err) => {
                warn!(
                    stage = %stage,
                    work_key = %work_key,
                    error = %err,
                    "Expected set unavailable, holding gate"
                );
                if self.is_expired(stage, work_key) {
                    self.stall(stage, work_key, &err).await;
                }
                return Ok(GateDecision::Held(HoldReason::ReferenceUnavailable));
            }
        };
        let evaluation = self.evaluate(stage, work_key, expected).await?;

        if evaluation.is_complete() {
            self.validate_once(stage, work_key).await;
        }
        if let Some(reason) = fired {
            self.metrics.record_duplicate();
            return Ok(GateDecision::AlreadyTriggered(reason));
        }

        let decision = self.decide(stage, &next, work_key, &evaluation).await;
        timer.finish_debug();
        decision
    }

    /// Handles the `max_wait` timer for `(stage, work_key)`.
    ///
    /// Forces a partial advance, or raises a single `stalled` alert when the
    /// expected set still cannot be resolved.
    pub async fn on_max_wait(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
    ) -> Result<GateDecision, StagegateError> {
        {
            let mut unit = self
                .tracked
                .entry((stage.clone(), work_key.clone()))
                .or_default();
            unit.timer = None;
            unit.expired = true;
        }

        let Some(next) = self.registry.next_stage(stage) else {
            return Ok(GateDecision::Terminal);
        };
        if let Some(reason) = self.ledger.fired(&next, work_key) {
            return Ok(GateDecision::AlreadyTriggered(reason));
        }

        info!(
            stage = %stage,
            work_key = %work_key,
            max_wait_secs = self.config.max_wait_secs,
            "max_wait elapsed without a trigger"
        );

        match self.reference.expected_sub_units(stage, work_key).await {
            Ok(expected) => {
                self.mark_resolved(stage, work_key);
                let evaluation = self.evaluate(stage, work_key, expected).await?;
                self.decide(stage, &next, work_key, &evaluation).await
            }
            Err(err) => {
                self.stall(stage, work_key, &err).await;
                Ok(GateDecision::Held(HoldReason::ReferenceUnavailable))
            }
        }
    }

    /// Re-examines every tracked unit.
    ///
    /// Forced triggers whose stragglers have since completed to the
    /// threshold are re-armed and topped up with a `full` trigger; units
    /// that never triggered are re-evaluated as if a completion had arrived.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let keys: Vec<UnitKey> = self.tracked.iter().map(|unit| unit.key().clone()).collect();
        let retention = self.config.freshness_window();

        for (stage, work_key) in keys {
            summary.examined += 1;
            let Some(next) = self.registry.next_stage(&stage) else {
                self.retire(&stage, &work_key);
                summary.retired += 1;
                continue;
            };

            let aged_out = self
                .tracked
                .get(&(stage.clone(), work_key.clone()))
                .and_then(|unit| unit.armed_at)
                .is_some_and(|at| at.elapsed() > retention);

            match self.ledger.fired(&next, &work_key) {
                Some(TriggerReason::Full) => {
                    if aged_out || self.validation_settled(&stage, &work_key) {
                        self.retire(&stage, &work_key);
                        summary.retired += 1;
                    }
                }
                Some(TriggerReason::ForcedPartial) => {
                    if aged_out {
                        self.retire(&stage, &work_key);
                        summary.retired += 1;
                    } else if self.top_up(&stage, &next, &work_key).await {
                        summary.topped_up += 1;
                    }
                }
                None => match self.reevaluate(&stage, &next, &work_key).await {
                    Ok(GateDecision::Triggered(trigger)) if trigger.is_partial() => {
                        summary.forced += 1;
                    }
                    Ok(GateDecision::Triggered(_)) => summary.triggered += 1,
                    Ok(GateDecision::Held(HoldReason::ReferenceUnavailable)) => {
                        summary.stalled += 1;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            stage = %stage,
                            work_key = %work_key,
                            error = %err,
                            "Reconciliation failed for unit"
                        );
                    }
                },
            }
        }

        debug!(?summary, "Reconciliation sweep finished");
        summary
    }

    /// Starts a new epoch for the successor of `stage`, allowing one more
    /// trigger for `work_key`. Returns the new epoch.
    pub fn rearm(&self, stage: &StageId, work_key: &WorkKey) -> Option<u64> {
        let next = self.registry.next_stage(stage)?;
        self.retire(stage, work_key);
        let epoch = self.ledger.rearm(&next, work_key);
        info!(
            stage = %stage,
            next_stage = %next,
            work_key = %work_key,
            epoch,
            "Gate re-armed"
        );
        Some(epoch)
    }

    /// Runs [`reconcile`](Self::reconcile) every `reconcile_interval` until
    /// the gate is dropped.
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let gate = Arc::downgrade(self);
        let period = self.config.reconcile_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gate) = gate.upgrade() else { break };
                gate.reconcile().await;
            }
        })
    }

    /// Evaluates every record broadcast by the tracker until the channel
    /// closes. A lagging receiver triggers a reconciliation sweep.
    pub async fn listen(self: Arc<Self>, mut records: broadcast::Receiver<CompletionRecord>) {
        loop {
            match records.recv().await {
                Ok(record) => {
                    if let Err(err) = self.on_completion(&record).await {
                        warn!(
                            stage = %record.stage,
                            work_key = %record.work_key,
                            error = %err,
                            "Gate evaluation failed"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Gate listener lagged, reconciling");
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn evaluate(
        &self,
        stage: &StageId,
        work_key: &WorkKey,
        expected: BTreeSet<SubKey>,
    ) -> Result<Evaluation, StagegateError> {
        let completed = self
            .tracker
            .completion_set(stage, work_key, self.config.freshness_window())
            .await?
            .intersection(&expected)
            .cloned()
            .collect();
        Ok(Evaluation {
            expected,
            completed,
        })
    }

    async fn decide(
        &self,
        stage: &StageId,
        next: &StageId,
        work_key: &WorkKey,
        evaluation: &Evaluation,
    ) -> Result<GateDecision, StagegateError> {
        let threshold = self.config.threshold_for(stage);
        let blocked = self.validation_blocks(stage, work_key);

        if evaluation.ratio() >= threshold && !blocked {
            return self
                .fire(stage, next, work_key, TriggerReason::Full, evaluation, false)
                .await;
        }
        if self.is_expired(stage, work_key) {
            return self.force(stage, next, work_key, evaluation).await;
        }
        if blocked {
            info!(
                stage = %stage,
                work_key = %work_key,
                "Holding gate on failed validation"
            );
            return Ok(GateDecision::Held(HoldReason::ValidationFailed));
        }

        debug!(
            stage = %stage,
            work_key = %work_key,
            completed = evaluation.completed.len(),
            expected = evaluation.expected.len(),
            threshold,
            "Gate waiting"
        );
        Ok(GateDecision::Waiting {
            completed: evaluation.completed.len(),
            expected: evaluation.expected.len(),
        })
    }

    async fn reevaluate(
        &self,
        stage: &StageId,
        next: &StageId,
        work_key: &WorkKey,
    ) -> Result<GateDecision, StagegateError> {
        match self.reference.expected_sub_units(stage, work_key).await {
            Ok(expected) => {
                self.mark_resolved(stage, work_key);
                let evaluation = self.evaluate(stage, work_key, expected).await?;
                self.decide(stage, next, work_key, &evaluation).await
            }
            Err(err) => {
                if self.is_expired(stage, work_key) {
                    self.stall(stage, work_key, &err).await;
                }
                Ok(GateDecision::Held(HoldReason::ReferenceUnavailable))
            }
        }
    }

    async fn top_up(&self, stage: &StageId, next: &StageId, work_key: &WorkKey) -> bool {
        if self.validation_blocks(stage, work_key) {
            return false;
        }
        let Ok(expected) = self.reference.expected_sub_units(stage, work_key).await else {
            return false;
        };
        let evaluation = match self.evaluate(stage, work_key, expected).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!(stage = %stage, work_key = %work_key, error = %err, "Top-up evaluation failed");
                return false;
            }
        };
        if evaluation.ratio() < self.config.threshold_for(stage) {
            return false;
        }

        let epoch = self.ledger.rearm(next, work_key);
        info!(
            stage = %stage,
            next_stage = %next,
            work_key = %work_key,
            epoch,
            "Stragglers completed, topping up forced trigger"
        );
        match self
            .fire(stage, next, work_key, TriggerReason::Full, &evaluation, true)
            .await
        {
            Ok(GateDecision::Triggered(_)) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(stage = %stage, work_key = %work_key, error = %err, "Top-up trigger not delivered");
                false
            }
        }
    }

    async fn force(
        &self,
        stage: &StageId,
        next: &StageId,
        work_key: &WorkKey,
        evaluation: &Evaluation,
    ) -> Result<GateDecision, StagegateError> {
        let decision = self
            .fire(stage, next, work_key, TriggerReason::ForcedPartial, evaluation, false)
            .await?;

        if let GateDecision::Triggered(trigger) = &decision {
            warn!(
                stage = %stage,
                next_stage = %next,
                work_key = %work_key,
                completed = trigger.completed,
                expected = trigger.expected,
                missing = ?trigger.missing,
                "Forced partial advance after max_wait"
            );
            Alert::new(AlertKind::ForcedPartial, work_key.clone())
                .with_stage(stage.clone())
                .with_missing(&trigger.missing)
                .with_detail(format!(
                    "{next} triggered with {}/{} sub-units of {stage} complete",
                    trigger.completed, trigger.expected
                ))
                .raise(self.alerts.as_ref())
                .await;
        }
        Ok(decision)
    }

    async fn fire(
        &self,
        stage: &StageId,
        next: &StageId,
        work_key: &WorkKey,
        reason: TriggerReason,
        evaluation: &Evaluation,
        top_up: bool,
    ) -> Result<GateDecision, StagegateError> {
        let Some(epoch) = self.ledger.try_claim(next, work_key, reason) else {
            self.metrics.record_duplicate();
            let existing = self.ledger.fired(next, work_key).unwrap_or(reason);
            return Ok(GateDecision::AlreadyTriggered(existing));
        };

        let trigger = TriggerEvent {
            next_stage: next.clone(),
            work_key: work_key.clone(),
            trigger_reason: reason,
            source_stage: stage.clone(),
            epoch,
            completed: evaluation.completed.len(),
            expected: evaluation.expected.len(),
            missing: evaluation.missing(),
            top_up,
            emitted_at: Utc::now(),
        };

        if let Err(err) = self.bus.publish(trigger.clone()).await {
            self.ledger.release(next, work_key, epoch);
            self.metrics.record_publish_failure();
            error!(
                next_stage = %next,
                work_key = %work_key,
                error = %err,
                "Failed to publish trigger"
            );
            return Err(err);
        }

        match reason {
            TriggerReason::Full => self.metrics.record_full(top_up),
            TriggerReason::ForcedPartial => self.metrics.record_forced(),
        }
        let timer = self
            .tracked
            .get_mut(&(stage.clone(), work_key.clone()))
            .and_then(|mut unit| unit.timer.take());
        if let Some(timer) = timer {
            timer.abort();
        }

        info!(
            next_stage = %next,
            work_key = %work_key,
            reason = %reason,
            epoch,
            completed = trigger.completed,
            expected = trigger.expected,
            top_up,
            "Trigger emitted"
        );
        Ok(GateDecision::Triggered(trigger))
    }

    fn arm_timer(self: &Arc<Self>, stage: &StageId, work_key: &WorkKey) {
        let mut unit = self
            .tracked
            .entry((stage.clone(), work_key.clone()))
            .or_default();
        if unit.timer.is_some() || unit.expired {
            return;
        }
        if unit.armed_at.is_none() {
            unit.armed_at = Some(Instant::now());
        }

        let gate = Arc::downgrade(self);
        let max_wait = self.config.max_wait();
        let (stage, work_key) = (stage.clone(), work_key.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            let Some(gate) = gate.upgrade() else { return };
            if let Err(err) = gate.on_max_wait(&stage, &work_key).await {
                error!(
                    stage = %stage,
                    work_key = %work_key,
                    error = %err,
                    "max_wait handling failed"
                );
            }
        });
        unit.timer = Some(handle.abort_handle());
    }

    async fn stall(&self, stage: &StageId, work_key: &WorkKey, err: &StagegateError) {
        let first = {
            let mut unit = self
                .tracked
                .entry((stage.clone(), work_key.clone()))
                .or_default();
            !std::mem::replace(&mut unit.stalled, true)
        };
        if !first {
            return;
        }

        self.metrics.record_stall();
        error!(
            stage = %stage,
            work_key = %work_key,
            error = %err,
            "Gate stalled: expected set unresolvable after max_wait"
        );
        Alert::new(AlertKind::Stalled, work_key.clone())
            .with_stage(stage.clone())
            .with_detail(err.to_string())
            .raise(self.alerts.as_ref())
            .await;
    }

    fn mark_resolved(&self, stage: &StageId, work_key: &WorkKey) {
        if let Some(mut unit) = self.tracked.get_mut(&(stage.clone(), work_key.clone())) {
            unit.stalled = false;
        }
    }

    async fn validate_once(&self, stage: &StageId, work_key: &WorkKey) {
        let Some(validator) = self.validators.get(stage).cloned() else {
            return;
        };
        if self.validation_settled(stage, work_key) {
            return;
        }

        match validator.check_and_alert(work_key, self.alerts.as_ref()).await {
            Ok(result) => {
                if let Some(mut unit) = self.tracked.get_mut(&(stage.clone(), work_key.clone())) {
                    unit.validation = Some(result.overall_status);
                }
            }
            Err(err) => warn!(
                stage = %stage,
                work_key = %work_key,
                error = %err,
                "Event-triggered validation could not run"
            ),
        }
    }

    fn wants_validation(&self, stage: &StageId, work_key: &WorkKey) -> bool {
        !self.validation_settled(stage, work_key)
    }

    fn validation_settled(&self, stage: &StageId, work_key: &WorkKey) -> bool {
        !self.validators.contains_key(stage)
            || self
                .tracked
                .get(&(stage.clone(), work_key.clone()))
                .is_some_and(|unit| unit.validation.is_some())
    }

    fn validation_blocks(&self, stage: &StageId, work_key: &WorkKey) -> bool {
        self.config.block_on_failed_validation
            && self
                .tracked
                .get(&(stage.clone(), work_key.clone()))
                .is_some_and(|unit| unit.validation == Some(CompletenessStatus::Failed))
    }

    fn is_expired(&self, stage: &StageId, work_key: &WorkKey) -> bool {
        self.tracked
            .get(&(stage.clone(), work_key.clone()))
            .is_some_and(|unit| unit.expired)
    }

    fn retire(&self, stage: &StageId, work_key: &WorkKey) {
        if let Some((_, unit)) = self.tracked.remove(&(stage.clone(), work_key.clone())) {
            if let Some(timer) = unit.timer {
                timer.abort();
            }
        }
    }
}

impl Drop for DependencyGate {
    fn drop(&mut self) {
        for unit in self.tracked.iter() {
            if let Some(timer) = &unit.timer {
                timer.abort();
            }
        }
    }
}
