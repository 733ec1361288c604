//! Tests for the dependency gate.

#[cfg(test)]
mod tests {
    use crate::completeness::CompletenessValidator;
    use crate::config::{CompletenessConfig, GateConfig};
    use crate::core::{CompletionEvent, StageId, SubKey, TaskStatus, TriggerReason, WorkKey};
    use crate::errors::StagegateError;
    use crate::events::CollectingEventSink;
    use crate::gate::{DependencyGate, GateDecision, HoldReason};
    use crate::registry::StageRegistry;
    use crate::testing::{
        assert_already_triggered, assert_triggered, assert_waiting, CollectingTriggerBus,
        MapCoverageSource, RecordingHandler, StaticReference,
    };
    use crate::tracker::CompletionTracker;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const MAX_WAIT: Duration = Duration::from_secs(60);

    struct Harness {
        gate: Arc<DependencyGate>,
        tracker: Arc<CompletionTracker>,
        reference: Arc<StaticReference>,
        bus: Arc<CollectingTriggerBus>,
        alerts: Arc<CollectingEventSink>,
    }

    fn registry() -> Arc<StageRegistry> {
        let registry = StageRegistry::builder()
            .stage("ingest", Arc::new(RecordingHandler::new()))
            .and_then(|b| b.stage("aggregate", Arc::new(RecordingHandler::new())))
            .and_then(|b| b.stage("publish", Arc::new(RecordingHandler::new())))
            .and_then(|b| b.build())
            .unwrap();
        Arc::new(registry)
    }

    fn config() -> GateConfig {
        GateConfig::default().with_max_wait(MAX_WAIT)
    }

    fn harness(config: GateConfig) -> Harness {
        build(config, None)
    }

    fn build(config: GateConfig, validator: Option<MapCoverageSource>) -> Harness {
        let reference = Arc::new(
            StaticReference::new().with_expected("ingest", "D", ["g1", "g2", "g3", "g4"]),
        );
        let tracker = Arc::new(CompletionTracker::default());
        let bus = Arc::new(CollectingTriggerBus::new());
        let alerts = Arc::new(CollectingEventSink::new());

        let mut gate = DependencyGate::new(
            registry(),
            tracker.clone(),
            reference.clone(),
            bus.clone(),
            config,
        )
        .with_alerts(alerts.clone());
        if let Some(source) = validator {
            let validator = CompletenessValidator::new(
                reference.clone(),
                "ingest",
                CompletenessConfig::default(),
            )
            .with_source(Arc::new(source));
            gate = gate.with_validator(Arc::new(validator));
        }

        Harness {
            gate: Arc::new(gate),
            tracker,
            reference,
            bus,
            alerts,
        }
    }

    impl Harness {
        async fn try_record(&self, event: CompletionEvent) -> Result<GateDecision, StagegateError> {
            let recorded = self.tracker.record_completion(event).await?;
            self.gate.on_completion(&recorded.record).await
        }

        async fn complete(&self, sub_key: &str) -> GateDecision {
            self.try_record(CompletionEvent::success("ingest", "D", sub_key, 10))
                .await
                .unwrap()
        }

        async fn complete_all(&self) -> GateDecision {
            let mut last = None;
            for sub_key in ["g1", "g2", "g3", "g4"] {
                last = Some(self.complete(sub_key).await);
            }
            last.unwrap()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn stage(s: &str) -> StageId {
        StageId::from(s)
    }

    fn work_key() -> WorkKey {
        WorkKey::from("D")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_only_at_full_completion() {
        let h = harness(config());

        assert_waiting(&h.complete("g1").await, 1, 4);
        assert_waiting(&h.complete("g2").await, 2, 4);
        assert_waiting(&h.complete("g3").await, 3, 4);
        assert!(h.bus.is_empty());

        let decision = h.complete("g4").await;
        let trigger = assert_triggered(&decision, TriggerReason::Full);
        assert_eq!(trigger.next_stage, stage("aggregate"));
        assert_eq!(trigger.source_stage, stage("ingest"));
        assert_eq!(trigger.epoch, 0);
        assert_eq!((trigger.completed, trigger.expected), (4, 4));
        assert!(trigger.missing.is_empty());
        assert_eq!(h.bus.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_completion_does_not_retrigger() {
        let h = harness(config());
        h.complete_all().await;

        assert_already_triggered(&h.complete("g4").await);
        assert_already_triggered(&h.complete("g2").await);

        assert_eq!(h.bus.len(), 1);
        assert_eq!(h.gate.metrics().duplicates_suppressed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluations_trigger_once() {
        let h = harness(config());
        let mut records = Vec::new();
        for sub_key in ["g1", "g2", "g3", "g4"] {
            let recorded = h
                .tracker
                .record_completion(CompletionEvent::success("ingest", "D", sub_key, 10))
                .await
                .unwrap();
            records.push(recorded.record);
        }

        let mut handles = Vec::new();
        for i in 0..32 {
            let gate = h.gate.clone();
            let record = records[i % records.len()].clone();
            handles.push(tokio::spawn(async move { gate.on_completion(&record).await }));
        }

        let mut triggered = 0;
        for result in futures::future::join_all(handles).await {
            if matches!(result.unwrap().unwrap(), GateDecision::Triggered(_)) {
                triggered += 1;
            }
        }

        assert_eq!(triggered, 1);
        assert_eq!(h.bus.len(), 1);
        assert_eq!(h.gate.metrics().triggers_full, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_below_one() {
        let h = harness(config().with_threshold(0.75));

        h.complete("g1").await;
        h.complete("g2").await;
        let decision = h.complete("g3").await;

        let trigger = assert_triggered(&decision, TriggerReason::Full);
        assert_eq!(trigger.missing, vec![SubKey::from("g4")]);
        assert_eq!(trigger.ratio(), 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_stage_threshold_overrides_default() {
        let h = harness(config().with_stage_threshold("ingest", 0.5));

        assert_waiting(&h.complete("g1").await, 1, 4);
        assert_triggered(&h.complete("g2").await, TriggerReason::Full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_expected_set_passes() {
        let h = harness(config());

        let decision = h
            .try_record(CompletionEvent::success("ingest", "2024-07-04", "none", 0))
            .await
            .unwrap();

        let trigger = assert_triggered(&decision, TriggerReason::Full);
        assert_eq!((trigger.completed, trigger.expected), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_and_suspicious_records_do_not_count() {
        let h = harness(config());
        h.complete("g1").await;
        h.complete("g2").await;

        let failed = h
            .try_record(CompletionEvent::failed("ingest", "D", "g3", "timeout"))
            .await
            .unwrap();
        assert_waiting(&failed, 2, 4);

        let suspicious = h
            .try_record(
                CompletionEvent::success("ingest", "D", "g4", 0)
                    .with_status(TaskStatus::EmptySuspicious),
            )
            .await
            .unwrap();
        assert_waiting(&suspicious, 2, 4);
        assert!(h.bus.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_partial_after_max_wait() {
        let h = harness(config());
        h.complete("g1").await;
        h.complete("g2").await;

        tokio::time::sleep(MAX_WAIT + Duration::from_secs(1)).await;

        let forced = h.bus.with_reason(TriggerReason::ForcedPartial);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].missing, vec![SubKey::from("g3"), SubKey::from("g4")]);
        assert_eq!(h.alerts.count("alert.forced_partial"), 1);
        assert_eq!(h.gate.metrics().triggers_forced, 1);

        let late = h.complete("g3").await;
        assert_eq!(late, GateDecision::AlreadyTriggered(TriggerReason::ForcedPartial));
        assert_eq!(h.bus.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cancelled_after_full_trigger() {
        let h = harness(config());
        h.complete_all().await;

        tokio::time::sleep(MAX_WAIT * 2).await;

        assert_eq!(h.bus.len(), 1);
        assert_eq!(h.gate.metrics().triggers_forced, 0);
        assert!(h.alerts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_outage_stalls_once_then_forces_after_recovery() {
        let h = harness(config());
        h.reference.set_available(false);

        let decision = h.complete("g1").await;
        assert_eq!(decision, GateDecision::Held(HoldReason::ReferenceUnavailable));

        tokio::time::sleep(MAX_WAIT + Duration::from_secs(1)).await;
        assert_eq!(h.alerts.count("alert.stalled"), 1);
        assert!(h.bus.is_empty());

        h.complete("g2").await;
        let summary = h.gate.reconcile().await;
        assert_eq!(summary.stalled, 1);
        assert_eq!(h.alerts.count("alert.stalled"), 1);
        assert_eq!(h.gate.metrics().stalls, 1);

        h.reference.set_available(true);
        let summary = h.gate.reconcile().await;
        assert_eq!(summary.forced, 1);

        let forced = h.bus.with_reason(TriggerReason::ForcedPartial);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_tops_up_forced_trigger() {
        let h = harness(config());
        h.complete("g1").await;
        h.complete("g2").await;
        tokio::time::sleep(MAX_WAIT + Duration::from_secs(1)).await;
        assert_eq!(h.bus.len(), 1);

        h.complete("g3").await;
        h.complete("g4").await;
        let summary = h.gate.reconcile().await;
        assert_eq!(summary.topped_up, 1);

        let triggers = h.bus.triggers();
        assert_eq!(triggers.len(), 2);
        let top_up = &triggers[1];
        assert_eq!(top_up.trigger_reason, TriggerReason::Full);
        assert_eq!(top_up.epoch, 1);
        assert!(top_up.top_up);
        assert_eq!(h.gate.metrics().top_ups, 1);

        let summary = h.gate.reconcile().await;
        assert_eq!(summary.topped_up, 0);
        assert_eq!(summary.retired, 1);
        assert_eq!(h.bus.len(), 2);
        assert_eq!(h.gate.tracked_units(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_leaves_unfinished_forced_trigger() {
        let h = harness(config());
        h.complete("g1").await;
        tokio::time::sleep(MAX_WAIT + Duration::from_secs(1)).await;

        h.complete("g2").await;
        let summary = h.gate.reconcile().await;

        assert_eq!(summary.topped_up, 0);
        assert_eq!(h.bus.len(), 1);
        assert_eq!(h.gate.ledger().epoch(&stage("aggregate"), &work_key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_allows_one_more_trigger() {
        let h = harness(config());
        h.complete_all().await;

        assert_eq!(h.gate.rearm(&stage("ingest"), &work_key()), Some(1));
        let decision = h.complete("g4").await;

        let trigger = assert_triggered(&decision, TriggerReason::Full);
        assert_eq!(trigger.epoch, 1);
        assert_eq!(h.bus.len(), 2);
        assert_already_triggered(&h.complete("g4").await);

        assert_eq!(h.gate.rearm(&stage("publish"), &work_key()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_releases_claim() {
        let h = harness(config());
        h.complete("g1").await;
        h.complete("g2").await;
        h.complete("g3").await;

        h.bus.set_failing(true);
        let result = h
            .try_record(CompletionEvent::success("ingest", "D", "g4", 10))
            .await;
        assert!(matches!(result, Err(StagegateError::TransientInfra(_))));
        assert_eq!(h.gate.metrics().publish_failures, 1);
        assert!(h.gate.ledger().fired(&stage("aggregate"), &work_key()).is_none());

        h.bus.set_failing(false);
        assert_triggered(&h.complete("g4").await, TriggerReason::Full);
        assert_eq!(h.bus.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_stage_never_triggers() {
        let h = harness(config());

        let decision = h
            .try_record(CompletionEvent::success("publish", "D", "site", 1))
            .await
            .unwrap();

        assert_eq!(decision, GateDecision::Terminal);
        assert!(h.bus.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_triggered_validation_alerts_on_gaps() {
        let source = MapCoverageSource::new("plays")
            .with_signals("g1", 40)
            .with_signals("g2", 38);
        let h = build(config(), Some(source));

        let decision = h.complete_all().await;

        assert_triggered(&decision, TriggerReason::Full);
        assert_eq!(h.alerts.count("alert.completeness_gap"), 1);

        h.complete("g4").await;
        assert_eq!(h.alerts.count("alert.completeness_gap"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_validation_holds_when_blocking() {
        let mut config = config();
        config.block_on_failed_validation = true;
        let h = build(config, Some(MapCoverageSource::new("plays")));

        let decision = h.complete_all().await;
        assert_eq!(decision, GateDecision::Held(HoldReason::ValidationFailed));
        assert!(h.bus.is_empty());

        tokio::time::sleep(MAX_WAIT + Duration::from_secs(1)).await;
        let forced = h.bus.with_reason(TriggerReason::ForcedPartial);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].completed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_evaluates_broadcast_records() {
        let h = harness(config());
        let listener = tokio::spawn(h.gate.clone().listen(h.tracker.subscribe()));

        for sub_key in ["g1", "g2", "g3", "g4"] {
            h.tracker
                .record_completion(CompletionEvent::success("ingest", "D", sub_key, 10))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(h.bus.len(), 1);
        listener.abort();
    }
}
