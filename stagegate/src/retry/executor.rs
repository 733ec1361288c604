//! Retry executor with injectable error classification.

use super::RetryConfig;
use crate::core::StageOutcome;
use crate::errors::{ErrorClass, StagegateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Classifies an error as transient or permanent.
pub trait ErrorClassifier<E>: Send + Sync {
    /// Returns the class of `err`.
    fn classify(&self, err: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, err: &E) -> ErrorClass {
        self(err)
    }
}

/// Classifier that uses [`StagegateError::class`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier<StagegateError> for DefaultClassifier {
    fn classify(&self, err: &StagegateError) -> ErrorClass {
        err.class()
    }
}

/// One failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: usize,
    /// Rendered error.
    pub error: String,
    /// How the error was classified.
    pub class: ErrorClass,
    /// Delay scheduled before the next attempt, if any.
    pub delay_ms: Option<u64>,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Why the executor stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The error was classified permanent.
    Permanent,
    /// `max_attempts` transient failures.
    Exhausted,
    /// The overall deadline elapsed.
    DeadlineExceeded,
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanent"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// The final failure record of a retried operation.
///
/// Carries the terminal error together with every attempt so no
/// diagnostic detail is lost.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Why retrying stopped.
    pub reason: GiveUpReason,
    /// The terminal error. `None` when the deadline cut an attempt short.
    pub error: Option<E>,
    /// Every failed attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// The configured deadline, if any.
    pub deadline_ms: Option<u64>,
}

impl<E> RetryFailure<E> {
    /// Number of attempts made.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Delays that were slept between attempts.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts
            .iter()
            .filter_map(|a| a.delay_ms.map(Duration::from_millis))
            .collect()
    }
}

impl From<RetryFailure<StagegateError>> for StagegateError {
    fn from(failure: RetryFailure<StagegateError>) -> Self {
        let attempts = failure.attempts.len();
        match (failure.reason, failure.error) {
            (GiveUpReason::Exhausted, Some(error)) => Self::Exhausted {
                attempts,
                error: Box::new(error),
            },
            (GiveUpReason::DeadlineExceeded, _) | (_, None) => Self::DeadlineExceeded {
                deadline_ms: failure.deadline_ms.unwrap_or_default(),
                attempts,
            },
            (GiveUpReason::Permanent, Some(error)) => error,
        }
    }
}

/// Wraps fallible async operations with classification, backoff and a deadline.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying transient failures.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        name: &str,
        mut operation: F,
        classifier: &C,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: ErrorClassifier<E> + ?Sized,
    {
        let started = Instant::now();
        let deadline = self.config.deadline().map(|d| started + d);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        loop {
            let attempt = attempts.len() + 1;

            let result = match deadline {
                Some(at) => match tokio::time::timeout_at(at, operation()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            operation = name,
                            attempt,
                            "Retry deadline elapsed during attempt"
                        );
                        attempts.push(AttemptRecord {
                            attempt,
                            error: "deadline elapsed during attempt".to_string(),
                            class: ErrorClass::Transient,
                            delay_ms: None,
                            failed_at: Utc::now(),
                        });
                        return Err(self.give_up(GiveUpReason::DeadlineExceeded, None, attempts));
                    }
                },
                None => operation().await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classifier.classify(&err);
            let mut record = AttemptRecord {
                attempt,
                error: err.to_string(),
                class,
                delay_ms: None,
                failed_at: Utc::now(),
            };

            if class == ErrorClass::Permanent {
                warn!(operation = name, attempt, error = %err, "Permanent error, not retrying");
                attempts.push(record);
                return Err(self.give_up(GiveUpReason::Permanent, Some(err), attempts));
            }

            if attempt >= max_attempts {
                warn!(
                    operation = name,
                    attempt,
                    error = %err,
                    "Transient error, attempts exhausted"
                );
                attempts.push(record);
                return Err(self.give_up(GiveUpReason::Exhausted, Some(err), attempts));
            }

            let delay = self.config.delay_for(attempt - 1);
            if let Some(at) = deadline {
                if Instant::now() + delay >= at {
                    warn!(
                        operation = name,
                        attempt,
                        error = %err,
                        "Next backoff would pass the retry deadline"
                    );
                    attempts.push(record);
                    return Err(self.give_up(GiveUpReason::DeadlineExceeded, Some(err), attempts));
                }
            }

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            record.delay_ms = Some(delay_ms);
            debug!(
                operation = name,
                attempt,
                delay_ms,
                error = %err,
                "Retrying after transient error"
            );
            attempts.push(record);
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs a stage invocation and classifies its counts.
    ///
    /// The classification is re-derived from the returned counts, so a
    /// handler cannot report zero rows from non-empty input as a success.
    /// A silent empty result is never retried, only logged so the caller
    /// can decide whether it was expected.
    pub async fn execute_stage<E, F, Fut, C>(
        &self,
        name: &str,
        operation: F,
        classifier: &C,
    ) -> Result<StageOutcome, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StageOutcome, E>>,
        E: fmt::Display,
        C: ErrorClassifier<E> + ?Sized,
    {
        let outcome = self.execute(name, operation, classifier).await?.reclassify();
        if outcome.is_suspicious() {
            warn!(
                operation = name,
                input_rows = outcome.input_rows,
                "Stage reported success with zero rows from non-empty input"
            );
        }
        Ok(outcome)
    }

    fn give_up<E>(
        &self,
        reason: GiveUpReason,
        error: Option<E>,
        attempts: Vec<AttemptRecord>,
    ) -> RetryFailure<E> {
        RetryFailure {
            reason,
            error,
            attempts,
            deadline_ms: self.config.deadline_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutcomeClass, TaskStatus};
    use crate::retry::JitterStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(10)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let executor = RetryExecutor::new(fast_config());
        let calls = AtomicUsize::new(0);

        let result: Result<i32, RetryFailure<StagegateError>> = executor
            .execute(
                "op",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(42) }
                },
                &DefaultClassifier,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_yields_exactly_max_attempts_with_increasing_delay() {
        let executor = RetryExecutor::new(
            RetryConfig::new()
                .with_max_attempts(4)
                .with_base_delay_ms(100),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> = executor
            .execute(
                "fetch",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(StagegateError::TransientInfra("rate limited".into()))
                    }
                },
                &DefaultClassifier,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.reason, GiveUpReason::Exhausted);
        assert_eq!(failure.attempt_count(), 4);

        let delays = failure.delays();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));

        let last = failure.attempts.last().unwrap();
        assert!(last.error.contains("rate limited"));
        assert!(last.delay_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_yields_exactly_one_try() {
        let executor = RetryExecutor::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> = executor
            .execute(
                "parse",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(StagegateError::PermanentData("missing column".into()))
                    }
                },
                &DefaultClassifier,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.reason, GiveUpReason::Permanent);

        let err: StagegateError = failure.into();
        assert!(matches!(err, StagegateError::PermanentData(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let executor = RetryExecutor::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let result = executor
            .execute(
                "flaky",
                || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 {
                            Err(StagegateError::TransientInfra(format!("attempt {n}")))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &DefaultClassifier,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_classifier() {
        let executor = RetryExecutor::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let classify = |err: &String| {
            if err.starts_with("retry") {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        };

        let result: Result<(), _> = executor
            .execute(
                "custom",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("retry me".to_string())
                    }
                },
                &classify,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_backoff_short() {
        let executor = RetryExecutor::new(
            RetryConfig::new()
                .with_max_attempts(10)
                .with_base_delay_ms(1000)
                .with_jitter(JitterStrategy::None)
                .with_deadline(Duration::from_millis(2500)),
        );

        let result: Result<(), _> = executor
            .execute(
                "slow",
                || async { Err(StagegateError::TransientInfra("timeout".into())) },
                &DefaultClassifier,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::DeadlineExceeded);
        // 1s then 2s backoff; the second would end past 2.5s.
        assert_eq!(failure.attempt_count(), 2);
        assert!(failure.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_hanging_attempt() {
        let executor = RetryExecutor::new(
            fast_config().with_deadline(Duration::from_secs(1)),
        );

        let result: Result<(), RetryFailure<StagegateError>> = executor
            .execute(
                "hang",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                &DefaultClassifier,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::DeadlineExceeded);
        assert!(failure.error.is_none());

        let err: StagegateError = failure.into();
        assert!(matches!(err, StagegateError::DeadlineExceeded { deadline_ms: 1000, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_empty_result_is_not_retried() {
        let executor = RetryExecutor::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = executor
            .execute_stage(
                "extract",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, StagegateError>(StageOutcome::from_counts(0, 250))
                    }
                },
                &DefaultClassifier,
            )
            .await
            .unwrap();

        assert!(outcome.is_suspicious());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reported_success_with_zero_rows_is_reclassified() {
        let executor = RetryExecutor::new(fast_config());

        let outcome = executor
            .execute_stage(
                "extract",
                || async {
                    Ok::<_, StagegateError>(StageOutcome {
                        rows_processed: 0,
                        input_rows: 10,
                        expected_rows: None,
                        classification: OutcomeClass::Success,
                    })
                },
                &DefaultClassifier,
            )
            .await
            .unwrap();

        assert_eq!(outcome.classification, OutcomeClass::EmptySuspicious);
        assert_eq!(outcome.task_status(), TaskStatus::EmptySuspicious);
    }

    #[tokio::test]
    async fn test_accepted_empty_result_stays_accepted() {
        let executor = RetryExecutor::new(fast_config());

        let outcome = executor
            .execute_stage(
                "extract",
                || async {
                    Ok::<_, StagegateError>(StageOutcome::from_counts(0, 10).accept_empty())
                },
                &DefaultClassifier,
            )
            .await
            .unwrap();

        assert_eq!(outcome.task_status(), TaskStatus::Success);
    }
}
