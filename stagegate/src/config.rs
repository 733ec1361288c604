//! Configuration for the orchestration core.
//!
//! Every option has a serde default so a partial JSON document (or none at
//! all) yields a usable configuration. Call [`OrchestratorConfig::validate`]
//! after loading.

use crate::core::StageId;
use crate::errors::StagegateError;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION_SECS: f64 = 315_360_000.0;

const MIN_DURATION_SECS: f64 = 0.001;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Dependency gate settings.
    #[serde(default)]
    pub gate: GateConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Retry executor settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Completeness validator settings.
    #[serde(default)]
    pub completeness: CompletenessConfig,
    /// Batch fan-out settings.
    #[serde(default)]
    pub batch: BatchConfig,
}

impl OrchestratorConfig {
    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, StagegateError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StagegateError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), StagegateError> {
        check_ratio("gate.default_threshold", self.gate.default_threshold)?;
        for (stage, threshold) in &self.gate.per_stage_threshold {
            check_ratio(&format!("gate.per_stage_threshold.{stage}"), *threshold)?;
        }
        check_positive("gate.max_wait_secs", self.gate.max_wait_secs)?;
        check_positive("gate.freshness_window_secs", self.gate.freshness_window_secs)?;
        check_positive("gate.reconcile_interval_secs", self.gate.reconcile_interval_secs)?;

        check_positive("breaker.base_cooldown_secs", self.breaker.base_cooldown_secs)?;
        check_positive("breaker.cooldown_cap_secs", self.breaker.cooldown_cap_secs)?;
        if self.breaker.failure_threshold == 0 {
            return Err(StagegateError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.breaker.cooldown_cap_secs < self.breaker.base_cooldown_secs {
            return Err(StagegateError::Config(
                "breaker.cooldown_cap_secs must not be below breaker.base_cooldown_secs".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(StagegateError::Config("retry.max_attempts must be at least 1".into()));
        }
        check_millis("retry.max_delay_ms", Some(self.retry.max_delay_ms))?;
        check_millis("retry.deadline_ms", self.retry.deadline_ms)?;
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(StagegateError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }

        check_ratio("completeness.default_threshold", self.completeness.default_threshold)?;
        for (source, threshold) in &self.completeness.per_source_threshold {
            check_ratio(&format!("completeness.per_source_threshold.{source}"), *threshold)?;
        }

        if self.batch.worker_pool_size == 0 {
            return Err(StagegateError::Config("batch.worker_pool_size must be at least 1".into()));
        }
        check_positive("batch.fan_in_timeout_secs", self.batch.fan_in_timeout_secs)?;

        Ok(())
    }
}

fn check_positive(name: &str, value: f64) -> Result<(), StagegateError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(StagegateError::Config(format!("{name} must be positive, got {value}")));
    }
    if value > MAX_DURATION_SECS {
        return Err(StagegateError::Config(format!(
            "{name} must not exceed {MAX_DURATION_SECS} seconds, got {value}"
        )));
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn check_millis(name: &str, value: Option<u64>) -> Result<(), StagegateError> {
    match value {
        Some(ms) if ms as f64 / 1000.0 > MAX_DURATION_SECS => Err(StagegateError::Config(format!(
            "{name} must not exceed {MAX_DURATION_SECS} seconds, got {ms}ms"
        ))),
        _ => Ok(()),
    }
}

/// Converts configured seconds into a `Duration` without panicking.
///
/// Values are clamped into `[1ms, MAX_DURATION_SECS]`; NaN maps to the floor.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::from_secs_f64(MIN_DURATION_SECS);
    }
    Duration::from_secs_f64(secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS))
}

fn check_ratio(name: &str, value: f64) -> Result<(), StagegateError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(StagegateError::Config(format!("{name} must be within 0.0..=1.0, got {value}")))
    }
}

/// Dependency gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Completion ratio required to trigger the next stage.
    #[serde(default = "default_gate_threshold")]
    pub default_threshold: f64,
    /// Per-stage overrides of the threshold, keyed by the upstream stage.
    #[serde(default)]
    pub per_stage_threshold: HashMap<StageId, f64>,
    /// Seconds to wait before forcing a partial advance.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: f64,
    /// Completion records older than this are ignored.
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: f64,
    /// Interval of the reconciliation sweep.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: f64,
    /// Hold the gate when event-triggered validation reports FAILED.
    #[serde(default)]
    pub block_on_failed_validation: bool,
}

fn default_gate_threshold() -> f64 {
    1.0
}

fn default_max_wait() -> f64 {
    6.0 * 3600.0
}

fn default_freshness_window() -> f64 {
    36.0 * 3600.0
}

fn default_reconcile_interval() -> f64 {
    15.0 * 60.0
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_gate_threshold(),
            per_stage_threshold: HashMap::new(),
            max_wait_secs: default_max_wait(),
            freshness_window_secs: default_freshness_window(),
            reconcile_interval_secs: default_reconcile_interval(),
            block_on_failed_validation: false,
        }
    }
}

impl GateConfig {
    /// Sets the default threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.default_threshold = threshold;
        self
    }

    /// Sets a threshold for one upstream stage.
    #[must_use]
    pub fn with_stage_threshold(mut self, stage: impl Into<StageId>, threshold: f64) -> Self {
        self.per_stage_threshold.insert(stage.into(), threshold);
        self
    }

    /// Sets `max_wait`.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_secs = max_wait.as_secs_f64();
        self
    }

    /// Sets the freshness window.
    #[must_use]
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window_secs = window.as_secs_f64();
        self
    }

    /// Returns the threshold for an upstream stage.
    #[must_use]
    pub fn threshold_for(&self, stage: &StageId) -> f64 {
        self.per_stage_threshold
            .get(stage)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Gets `max_wait` as a Duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        secs_to_duration(self.max_wait_secs)
    }

    /// Gets the freshness window as a Duration.
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        secs_to_duration(self.freshness_window_secs)
    }

    /// Gets the reconciliation interval as a Duration.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        secs_to_duration(self.reconcile_interval_secs)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial cooldown before a half-open trial.
    #[serde(default = "default_base_cooldown")]
    pub base_cooldown_secs: f64,
    /// Upper bound for the doubled cooldown.
    #[serde(default = "default_cooldown_cap")]
    pub cooldown_cap_secs: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_base_cooldown() -> f64 {
    1800.0
}

fn default_cooldown_cap() -> f64 {
    4.0 * 3600.0
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_cooldown_secs: default_base_cooldown(),
            cooldown_cap_secs: default_cooldown_cap(),
        }
    }
}

impl BreakerConfig {
    /// Creates a breaker configuration.
    #[must_use]
    pub fn new(failure_threshold: u32, base_cooldown: Duration, cooldown_cap: Duration) -> Self {
        Self {
            failure_threshold,
            base_cooldown_secs: base_cooldown.as_secs_f64(),
            cooldown_cap_secs: cooldown_cap.as_secs_f64(),
        }
    }

    /// Gets the base cooldown as a Duration.
    #[must_use]
    pub fn base_cooldown(&self) -> Duration {
        secs_to_duration(self.base_cooldown_secs)
    }

    /// Gets the cooldown cap as a Duration.
    #[must_use]
    pub fn cooldown_cap(&self) -> Duration {
        secs_to_duration(self.cooldown_cap_secs)
    }
}

/// Completeness validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessConfig {
    /// Coverage ratio a source must reach to be OK.
    #[serde(default = "default_completeness_threshold")]
    pub default_threshold: f64,
    /// Per-source overrides, keyed by source id.
    #[serde(default)]
    pub per_source_threshold: HashMap<String, f64>,
    /// Signals an entity needs in a source to count as present.
    #[serde(default = "default_min_signal_count")]
    pub min_signal_count: u64,
    /// Days covered by the scheduled sweep.
    #[serde(default = "default_trailing_days")]
    pub trailing_days: u32,
}

fn default_completeness_threshold() -> f64 {
    0.9
}

fn default_min_signal_count() -> u64 {
    1
}

fn default_trailing_days() -> u32 {
    3
}

impl Default for CompletenessConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_completeness_threshold(),
            per_source_threshold: HashMap::new(),
            min_signal_count: default_min_signal_count(),
            trailing_days: default_trailing_days(),
        }
    }
}

impl CompletenessConfig {
    /// Sets a threshold for one source.
    #[must_use]
    pub fn with_source_threshold(mut self, source: impl Into<String>, threshold: f64) -> Self {
        self.per_source_threshold.insert(source.into(), threshold);
        self
    }

    /// Sets the per-entity noise floor.
    #[must_use]
    pub fn with_min_signal_count(mut self, count: u64) -> Self {
        self.min_signal_count = count;
        self
    }

    /// Returns the threshold for a source.
    #[must_use]
    pub fn threshold_for(&self, source: &str) -> f64 {
        self.per_source_threshold
            .get(source)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// Batch fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum concurrent workers.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Seconds to wait for all workers before consolidating what is available.
    #[serde(default = "default_fan_in_timeout")]
    pub fan_in_timeout_secs: f64,
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_fan_in_timeout() -> f64 {
    600.0
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            fan_in_timeout_secs: default_fan_in_timeout(),
        }
    }
}

impl BatchConfig {
    /// Sets the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Sets the fan-in timeout.
    #[must_use]
    pub fn with_fan_in_timeout(mut self, timeout: Duration) -> Self {
        self.fan_in_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Gets the fan-in timeout as a Duration.
    #[must_use]
    pub fn fan_in_timeout(&self) -> Duration {
        secs_to_duration(self.fan_in_timeout_secs)
    }
}
