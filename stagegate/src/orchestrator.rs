//! Wiring of the orchestration core.
//!
//! Inbound completion events flow into the tracker and the gate; triggers
//! coming back off the bus are dispatched to the next stage's handler, one
//! invocation per expected sub-unit, each through the retry executor and
//! the circuit breaker of the handler's resource. Handler results are
//! ingested as completions of that stage, so the chain advances by itself.

use crate::breaker::{BreakerRegistry, BreakerSnapshot, Probe};
use crate::completeness::{CompletenessValidator, ReferenceProvider};
use crate::config::OrchestratorConfig;
use crate::core::{CompletionEvent, StageOutcome, SubKey, TaskStatus, TriggerEvent};
use crate::errors::StagegateError;
use crate::events::{Alert, AlertKind, EventSink, LoggingEventSink, TriggerBus};
use crate::gate::{DependencyGate, GateDecision, GateMetricsSnapshot};
use crate::registry::{StageHandler, StageInvocation, StageRegistry};
use crate::retry::{DefaultClassifier, RetryExecutor};
use crate::tracker::CompletionTracker;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Summary of one dispatched trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Sub-units handed to the handler.
    pub invoked: usize,
    /// Sub-units that returned an outcome.
    pub succeeded: usize,
    /// Sub-units recorded as failed.
    pub failed: usize,
    /// Sub-units already complete for the stage, skipped on a top-up.
    pub skipped: usize,
}

/// Point-in-time status of the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Gate counters.
    pub gate: GateMetricsSnapshot,
    /// Units the gate is still watching.
    pub tracked_units: usize,
    /// State of every breaker created so far.
    pub breakers: Vec<BreakerSnapshot>,
}

/// Probes a handler's dependency while its breaker is open.
struct HandlerProbe<'a> {
    handler: &'a dyn StageHandler,
    invocation: &'a StageInvocation,
}

#[async_trait]
impl Probe for HandlerProbe<'_> {
    async fn probe(&self) -> bool {
        self.handler.probe(self.invocation).await
    }
}

/// The assembled orchestration core.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    tracker: Arc<CompletionTracker>,
    reference: Arc<dyn ReferenceProvider>,
    gate: Arc<DependencyGate>,
    breakers: BreakerRegistry,
    retry: RetryExecutor,
    alerts: Arc<dyn EventSink>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder(
        registry: StageRegistry,
        reference: Arc<dyn ReferenceProvider>,
        bus: Arc<dyn TriggerBus>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            reference,
            bus,
            config: OrchestratorConfig::default(),
            tracker: None,
            alerts: None,
            validators: Vec::new(),
        }
    }

    /// The completion tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    /// The dependency gate.
    #[must_use]
    pub fn gate(&self) -> &Arc<DependencyGate> {
        &self.gate
    }

    /// Breakers keyed by handler resource.
    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Records one completion event, alerts on failed or suspicious tasks,
    /// and evaluates the gate.
    pub async fn ingest(&self, event: CompletionEvent) -> Result<GateDecision, StagegateError> {
        let recorded = self.tracker.record_completion(event).await?;
        let record = &recorded.record;

        if recorded.outcome.is_current() && record.status.needs_attention() {
            let kind = match record.status {
                TaskStatus::Failed => AlertKind::TaskFailed,
                _ => AlertKind::EmptySuspicious,
            };
            let mut alert = Alert::new(kind, record.work_key.clone())
                .with_stage(record.stage.clone())
                .with_sub_key(record.sub_key.clone())
                .with_row_count(record.row_count);
            if let Some(detail) = &record.error_detail {
                alert = alert.with_detail(detail.clone());
            }
            alert.raise(self.alerts.as_ref()).await;
        }

        self.gate.on_completion(record).await
    }

    /// Ingests completion events until the channel closes.
    pub async fn run_inbound(self: Arc<Self>, mut events: mpsc::Receiver<CompletionEvent>) {
        while let Some(event) = events.recv().await {
            let (stage, work_key) = (event.stage_name.clone(), event.work_key.clone());
            match self.ingest(event).await {
                Ok(decision) => {
                    debug!(stage = %stage, work_key = %work_key, ?decision, "Completion ingested");
                }
                Err(err) => error!(
                    stage = %stage,
                    work_key = %work_key,
                    error = %err,
                    "Failed to ingest completion"
                ),
            }
        }
        info!("Inbound completion channel closed");
    }

    /// Runs the triggered stage for every expected sub-unit.
    ///
    /// Each invocation goes through the retry executor and the breaker of
    /// the handler's resource; its result is ingested as a completion of the
    /// triggered stage. A top-up skips sub-units that already succeeded.
    pub async fn dispatch_trigger(
        &self,
        trigger: &TriggerEvent,
    ) -> Result<DispatchReport, StagegateError> {
        let stage = &trigger.next_stage;
        let work_key = &trigger.work_key;
        let handler = self.registry.handler(stage)?;
        let expected = self.reference.expected_sub_units(stage, work_key).await?;

        let mut report = DispatchReport::default();
        let pending: Vec<SubKey> = if trigger.top_up {
            let done = self
                .tracker
                .completion_set(stage, work_key, self.config.gate.freshness_window())
                .await?;
            report.skipped = expected.intersection(&done).count();
            expected.difference(&done).cloned().collect()
        } else {
            expected.into_iter().collect()
        };

        info!(
            stage = %stage,
            work_key = %work_key,
            reason = %trigger.trigger_reason,
            epoch = trigger.epoch,
            sub_units = pending.len(),
            skipped = report.skipped,
            "Dispatching trigger"
        );

        let invocations: Vec<StageInvocation> = pending
            .into_iter()
            .map(|sub_key| StageInvocation::new(stage.clone(), work_key.clone(), sub_key))
            .collect();
        let results = join_all(
            invocations
                .iter()
                .map(|invocation| self.invoke(handler.as_ref(), invocation)),
        )
        .await;

        for (invocation, result) in invocations.into_iter().zip(results) {
            report.invoked += 1;
            let event = match result {
                Ok(outcome) => {
                    report.succeeded += 1;
                    CompletionEvent::success(
                        invocation.stage,
                        invocation.work_key,
                        invocation.sub_key,
                        outcome.rows_processed,
                    )
                    .with_status(outcome.task_status())
                }
                Err(err) => {
                    report.failed += 1;
                    CompletionEvent::failed(
                        invocation.stage,
                        invocation.work_key,
                        invocation.sub_key,
                        err.to_string(),
                    )
                }
            };
            if let Err(err) = self.ingest(event).await {
                warn!(stage = %stage, work_key = %work_key, error = %err, "Could not record stage result");
            }
        }

        Ok(report)
    }

    /// Dispatches triggers until the channel closes.
    pub async fn run_triggers(self: Arc<Self>, mut triggers: mpsc::Receiver<TriggerEvent>) {
        while let Some(trigger) = triggers.recv().await {
            match self.dispatch_trigger(&trigger).await {
                Ok(report) => info!(
                    stage = %trigger.next_stage,
                    work_key = %trigger.work_key,
                    invoked = report.invoked,
                    failed = report.failed,
                    "Trigger dispatched"
                ),
                Err(err) => error!(
                    stage = %trigger.next_stage,
                    work_key = %trigger.work_key,
                    error = %err,
                    "Trigger dispatch failed"
                ),
            }
        }
        info!("Trigger channel closed");
    }

    /// Spawns the inbound loop, the trigger loop and the reconciliation
    /// sweep. Dropping the returned set stops the loops.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::Receiver<CompletionEvent>,
        triggers: mpsc::Receiver<TriggerEvent>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_inbound(events));
        tasks.spawn(self.clone().run_triggers(triggers));

        let reconciler = self.gate.spawn_reconciler();
        tasks.spawn(async move {
            if let Err(err) = reconciler.await {
                if !err.is_cancelled() {
                    error!(error = %err, "Reconciler stopped");
                }
            }
        });
        tasks
    }

    /// Returns gate counters and breaker states.
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            gate: self.gate.metrics(),
            tracked_units: self.gate.tracked_units(),
            breakers: self.breakers.snapshot_all(),
        }
    }

    async fn invoke(
        &self,
        handler: &dyn StageHandler,
        invocation: &StageInvocation,
    ) -> Result<StageOutcome, StagegateError> {
        let breaker = self.breakers.get_or_create(&handler.resource_key(invocation));
        let breaker = breaker.as_ref();
        let probe = HandlerProbe {
            handler,
            invocation,
        };
        let probe = &probe;
        let name = invocation.to_string();

        self.retry
            .execute_stage(
                &name,
                move || {
                    breaker.call_with(
                        probe,
                        move || handler.invoke(invocation),
                        StagegateError::is_upstream_failure,
                    )
                },
                &DefaultClassifier,
            )
            .await
            .map_err(StagegateError::from)
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: StageRegistry,
    reference: Arc<dyn ReferenceProvider>,
    bus: Arc<dyn TriggerBus>,
    config: OrchestratorConfig,
    tracker: Option<Arc<CompletionTracker>>,
    alerts: Option<Arc<dyn EventSink>>,
    validators: Vec<CompletenessValidator>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `tracker` instead of an in-memory one.
    #[must_use]
    pub fn tracker(mut self, tracker: Arc<CompletionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Sets the alerting sink.
    #[must_use]
    pub fn alerts(mut self, alerts: Arc<dyn EventSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Registers an event-triggered completeness check.
    #[must_use]
    pub fn validator(mut self, validator: CompletenessValidator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Validates the configuration and assembles the core.
    pub fn build(self) -> Result<Arc<Orchestrator>, StagegateError> {
        self.config.validate()?;

        let registry = Arc::new(self.registry);
        let tracker = self.tracker.unwrap_or_default();
        let alerts = self
            .alerts
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));

        let mut gate = DependencyGate::new(
            registry.clone(),
            tracker.clone(),
            self.reference.clone(),
            self.bus,
            self.config.gate.clone(),
        )
        .with_alerts(alerts.clone());
        for validator in self.validators {
            gate = gate.with_validator(Arc::new(validator));
        }

        Ok(Arc::new(Orchestrator {
            registry,
            tracker,
            reference: self.reference,
            gate: Arc::new(gate),
            breakers: BreakerRegistry::new(self.config.breaker.clone()),
            retry: RetryExecutor::new(self.config.retry.clone()),
            alerts,
            config: self.config,
        }))
    }
}
