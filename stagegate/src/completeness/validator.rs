//! The completeness validator.

use super::{
    CompletenessReport, CompletenessResult, CompletenessStatus, CoverageSource,
    ReferenceProvider, SourceCoverage,
};
use crate::config::CompletenessConfig;
use crate::core::{completion_ratio, StageId, SubKey, WorkKey};
use crate::errors::StagegateError;
use crate::events::{Alert, AlertKind, EventSink};
use crate::utils::{date_range, trailing_window, work_key_for_date};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Scores every registered source against the reference expected set.
pub struct CompletenessValidator {
    reference: Arc<dyn ReferenceProvider>,
    stage: StageId,
    sources: Vec<Arc<dyn CoverageSource>>,
    config: CompletenessConfig,
}

impl std::fmt::Debug for CompletenessValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletenessValidator")
            .field("stage", &self.stage)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.source_id()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl CompletenessValidator {
    /// Creates a validator whose expected set is that of `stage`.
    #[must_use]
    pub fn new(
        reference: Arc<dyn ReferenceProvider>,
        stage: impl Into<StageId>,
        config: CompletenessConfig,
    ) -> Self {
        Self {
            reference,
            stage: stage.into(),
            sources: Vec::new(),
            config,
        }
    }

    /// Registers a coverage source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn CoverageSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// The stage whose expected set is validated.
    #[must_use]
    pub fn stage(&self) -> &StageId {
        &self.stage
    }

    /// Checks one work unit.
    ///
    /// A source that cannot be queried is scored FAILED with every expected
    /// entity missing. Fails only when the expected set itself cannot be
    /// resolved.
    pub async fn check(&self, work_key: &WorkKey) -> Result<CompletenessResult, StagegateError> {
        let expected = self
            .reference
            .expected_sub_units(&self.stage, work_key)
            .await?;

        let scored = join_all(
            self.sources
                .iter()
                .map(|source| self.score(source.as_ref(), work_key, &expected)),
        )
        .await;
        let per_source: BTreeMap<String, SourceCoverage> = scored
            .into_iter()
            .map(|coverage| (coverage.source_id.clone(), coverage))
            .collect();

        let overall_status = CompletenessStatus::combine(per_source.values().map(|c| c.status));
        let discrepancies: BTreeSet<SubKey> = per_source
            .values()
            .filter(|c| c.status != CompletenessStatus::Ok)
            .flat_map(|c| c.missing.iter().cloned())
            .collect();

        info!(
            stage = %self.stage,
            work_key = %work_key,
            expected = expected.len(),
            overall = %overall_status,
            discrepancies = discrepancies.len(),
            "Completeness checked"
        );

        Ok(CompletenessResult {
            work_key: work_key.clone(),
            expected_count: expected.len(),
            per_source,
            overall_status,
            discrepancies: discrepancies.into_iter().collect(),
            checked_at: Utc::now(),
        })
    }

    async fn score(
        &self,
        source: &dyn CoverageSource,
        work_key: &WorkKey,
        expected: &BTreeSet<SubKey>,
    ) -> SourceCoverage {
        let source_id = source.source_id().to_string();
        let threshold = self.config.threshold_for(&source_id);

        let counts = match source.signal_counts(work_key, expected).await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(
                    source = %source_id,
                    work_key = %work_key,
                    error = %err,
                    "Coverage source unavailable"
                );
                return SourceCoverage {
                    source_id,
                    observed_count: 0,
                    expected_count: expected.len(),
                    threshold,
                    status: CompletenessStatus::Failed,
                    missing: expected.iter().cloned().collect(),
                    error: Some(err.to_string()),
                };
            }
        };

        let floor = self.config.min_signal_count;
        let (observed, missing): (Vec<&SubKey>, Vec<&SubKey>) = expected
            .iter()
            .partition(|entity| counts.get(*entity).copied().unwrap_or(0) >= floor);

        let status = if completion_ratio(observed.len(), expected.len()) >= threshold {
            CompletenessStatus::Ok
        } else {
            CompletenessStatus::Failed
        };

        SourceCoverage {
            source_id,
            observed_count: observed.len(),
            expected_count: expected.len(),
            threshold,
            status,
            missing: missing.into_iter().cloned().collect(),
            error: None,
        }
    }

    /// Checks every date from `start` to `end` inclusive.
    pub async fn check_range(&self, start: NaiveDate, end: NaiveDate) -> CompletenessReport {
        let mut report = CompletenessReport::default();
        for day in date_range(start, end) {
            let work_key = work_key_for_date(day);
            match self.check(&work_key).await {
                Ok(result) => report.results.push(result),
                Err(err) => {
                    warn!(work_key = %work_key, error = %err, "Expected set unresolved");
                    report.unresolved.push((work_key, err.to_string()));
                }
            }
        }
        report
    }

    /// Scheduled mode: checks the configured trailing window ending `today`.
    pub async fn sweep_trailing(&self, today: NaiveDate) -> CompletenessReport {
        let (start, end) = trailing_window(today, self.config.trailing_days);
        self.check_range(start, end).await
    }

    /// Event-triggered mode: checks `work_key` and raises an alert on gaps.
    pub async fn check_and_alert(
        &self,
        work_key: &WorkKey,
        sink: &dyn EventSink,
    ) -> Result<CompletenessResult, StagegateError> {
        let result = self.check(work_key).await?;
        if result.has_gaps() {
            Alert::new(AlertKind::CompletenessGap, work_key.clone())
                .with_stage(self.stage.clone())
                .with_missing(&result.discrepancies)
                .with_detail(format!("{}: {}", result.overall_status, result.gap_summary()))
                .raise(sink)
                .await;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completeness::MockReferenceProvider;
    use crate::events::CollectingEventSink;
    use crate::testing::{MapCoverageSource, StaticReference};
    use pretty_assertions::assert_eq;

    fn keys(items: &[&str]) -> BTreeSet<SubKey> {
        items.iter().map(|s| SubKey::from(*s)).collect()
    }

    fn abc_reference() -> Arc<dyn ReferenceProvider> {
        let mut reference = MockReferenceProvider::new();
        reference
            .expect_expected_sub_units()
            .returning(|_, _| Ok(keys(&["A", "B", "C"])));
        Arc::new(reference)
    }

    #[tokio::test]
    async fn test_one_ok_one_failed_source_is_degraded() {
        let validator = CompletenessValidator::new(
            abc_reference(),
            "ingest",
            CompletenessConfig::default()
                .with_source_threshold("source1", 0.6)
                .with_source_threshold("source2", 0.6),
        )
        .with_source(Arc::new(
            MapCoverageSource::new("source1")
                .with_signals("A", 4)
                .with_signals("B", 2),
        ))
        .with_source(Arc::new(MapCoverageSource::new("source2")));

        let result = validator.check(&WorkKey::from("D")).await.unwrap();

        assert_eq!(result.per_source["source1"].status, CompletenessStatus::Ok);
        assert_eq!(result.per_source["source1"].missing, vec![SubKey::from("C")]);
        assert_eq!(result.per_source["source2"].status, CompletenessStatus::Failed);
        assert_eq!(result.per_source["source2"].observed_count, 0);
        assert_eq!(result.overall_status, CompletenessStatus::Degraded);
        assert_eq!(result.discrepancies, Vec::from_iter(keys(&["A", "B", "C"])));
    }

    #[tokio::test]
    async fn test_noise_floor_excludes_stub_records() {
        let validator = CompletenessValidator::new(
            abc_reference(),
            "ingest",
            CompletenessConfig::default().with_min_signal_count(3),
        )
        .with_source(Arc::new(
            MapCoverageSource::new("plays")
                .with_signals("A", 120)
                .with_signals("B", 140)
                .with_signals("C", 1),
        ));

        let result = validator.check(&WorkKey::from("D")).await.unwrap();
        let plays = &result.per_source["plays"];
        assert_eq!(plays.observed_count, 2);
        assert_eq!(plays.status, CompletenessStatus::Failed);
        assert_eq!(result.overall_status, CompletenessStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_expected_set_is_ok() {
        let reference = Arc::new(StaticReference::new());
        let validator = CompletenessValidator::new(reference, "ingest", CompletenessConfig::default())
            .with_source(Arc::new(MapCoverageSource::new("plays")));

        let result = validator.check(&WorkKey::from("2024-07-04")).await.unwrap();
        assert_eq!(result.overall_status, CompletenessStatus::Ok);
        assert!(result.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_fails_only_that_source() {
        let validator = CompletenessValidator::new(abc_reference(), "ingest", CompletenessConfig::default())
            .with_source(Arc::new(
                MapCoverageSource::new("boxscores")
                    .with_signals("A", 1)
                    .with_signals("B", 1)
                    .with_signals("C", 1),
            ))
            .with_source(Arc::new(MapCoverageSource::new("odds").unavailable()));

        let result = validator.check(&WorkKey::from("D")).await.unwrap();
        assert_eq!(result.overall_status, CompletenessStatus::Degraded);
        assert!(result.per_source["odds"].error.is_some());
    }

    #[tokio::test]
    async fn test_check_range_reports_unresolved_days() {
        let reference = Arc::new(
            StaticReference::new()
                .with_expected("ingest", "2024-11-01", ["g1"])
                .with_expected("ingest", "2024-11-02", ["g1", "g2"]),
        );
        reference.fail_for("2024-11-03");

        let validator = CompletenessValidator::new(reference, "ingest", CompletenessConfig::default())
            .with_source(Arc::new(
                MapCoverageSource::new("plays").with_signals("g1", 5).with_signals("g2", 5),
            ));

        let today = NaiveDate::from_ymd_opt(2024, 11, 3).unwrap();
        let report = validator.sweep_trailing(today).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].0.as_str(), "2024-11-03");
        assert_eq!(report.exit_code(true), 2);
        assert_eq!(report.exit_code(false), 0);
    }

    #[tokio::test]
    async fn test_check_and_alert_raises_on_gaps_only() {
        let sink = CollectingEventSink::new();
        let validator = CompletenessValidator::new(abc_reference(), "ingest", CompletenessConfig::default())
            .with_source(Arc::new(MapCoverageSource::new("plays").with_signals("A", 1)));

        validator.check_and_alert(&WorkKey::from("D"), &sink).await.unwrap();

        let alerts = sink.events_of_type("alert.completeness_gap");
        assert_eq!(alerts.len(), 1);
        let payload = alerts[0].1.clone().unwrap();
        assert_eq!(payload["missing"], serde_json::json!(["B", "C"]));
    }

    struct SlowSource {
        id: &'static str,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl CoverageSource for SlowSource {
        fn source_id(&self) -> &str {
            self.id
        }

        async fn signal_counts(
            &self,
            _work_key: &WorkKey,
            entities: &BTreeSet<SubKey>,
        ) -> Result<std::collections::HashMap<SubKey, u64>, StagegateError> {
            tokio::time::sleep(self.delay).await;
            Ok(entities.iter().map(|e| (e.clone(), 1)).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_queried_concurrently() {
        let delay = std::time::Duration::from_secs(30);
        let validator =
            CompletenessValidator::new(abc_reference(), "scrape", CompletenessConfig::default())
                .with_source(Arc::new(SlowSource { id: "boxscores", delay }))
                .with_source(Arc::new(SlowSource { id: "play_by_play", delay }));

        let started = tokio::time::Instant::now();
        let result = validator.check(&WorkKey::from("2024-11-02")).await.unwrap();

        assert_eq!(result.overall_status, CompletenessStatus::Ok);
        assert_eq!(result.per_source.len(), 2);
        assert!(started.elapsed() < delay * 2);
    }
}
