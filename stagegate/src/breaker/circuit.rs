//! Circuit breaker state machine.

use super::Probe;
use crate::config::BreakerConfig;
use crate::errors::StagegateError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast unless the probe succeeds.
    Open,
    /// A single trial call is in flight.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// The guarded resource.
    pub resource_key: String,
    /// Current state.
    pub state: BreakerState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Current cooldown in milliseconds.
    pub cooldown_ms: u64,
    /// Milliseconds since the breaker last opened, if it is not closed.
    pub open_for_ms: Option<u64>,
    /// Number of times the breaker has tripped.
    pub trips: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trips: u64,
}

/// A circuit breaker guarding one resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    resource_key: String,
    failure_threshold: u32,
    base_cooldown: Duration,
    cooldown_cap: Duration,
    inner: Mutex<Inner>,
}

/// Permission to run one call. A trial admission that is dropped without
/// being settled (e.g. the caller was cancelled) hands the trial back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for `resource_key`.
    #[must_use]
    pub fn new(resource_key: impl Into<String>, config: &BreakerConfig) -> Self {
        let base_cooldown = config.base_cooldown();
        Self {
            resource_key: resource_key.into(),
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown,
            cooldown_cap: config.cooldown_cap().max(base_cooldown),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: base_cooldown,
                trips: 0,
            }),
        }
    }

    /// Returns the guarded resource key.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Returns the current cooldown.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.inner.lock().cooldown
    }

    /// Returns a snapshot of the breaker.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            resource_key: self.resource_key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_ms: millis(inner.cooldown),
            open_for_ms: match inner.state {
                BreakerState::Closed => None,
                _ => inner.opened_at.map(|at| millis(at.elapsed())),
            },
            trips: inner.trips,
        }
    }

    /// Runs `operation` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, probe: &dyn Probe, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StagegateError>,
    {
        self.call_with(probe, operation, |_| true).await
    }

    /// Runs `operation` through the breaker.
    ///
    /// Only errors for which `is_failure` returns true count against the
    /// breaker; other errors (bad input, say) show the dependency answered
    /// and are treated as a successful contact.
    pub async fn call_with<T, E, F, Fut, P>(
        &self,
        probe: &dyn Probe,
        operation: F,
        is_failure: P,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StagegateError>,
        P: Fn(&E) -> bool,
    {
        let admission = self.admit(probe).await.map_err(E::from)?;

        match operation().await {
            Ok(value) => {
                admission.succeed();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    admission.fail();
                } else {
                    admission.succeed();
                }
                Err(err)
            }
        }
    }

    /// Records a success observed outside of [`call`](Self::call).
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Records a failure observed outside of [`call`](Self::call).
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Forces the breaker closed and resets the cooldown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    async fn admit(&self, probe: &dyn Probe) -> Result<Admission<'_>, StagegateError> {
        {
            let inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => return Ok(self.admission(false)),
                BreakerState::HalfOpen => return Err(self.rejection(&inner)),
                BreakerState::Open => {}
            }
        }

        // Probe without holding the lock.
        let available = probe.probe().await;

        let mut inner = self.inner.lock();
        if available {
            if inner.state != BreakerState::Closed {
                info!(
                    resource = %self.resource_key,
                    "Probe succeeded, closing circuit breaker"
                );
                self.close(&mut inner);
            }
            return Ok(self.admission(false));
        }

        match inner.state {
            BreakerState::Closed => Ok(self.admission(false)),
            BreakerState::HalfOpen => Err(self.rejection(&inner)),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= inner.cooldown {
                    info!(
                        resource = %self.resource_key,
                        cooldown_ms = millis(inner.cooldown),
                        "Cooldown elapsed, allowing half-open trial"
                    );
                    inner.state = BreakerState::HalfOpen;
                    Ok(self.admission(true))
                } else {
                    debug!(resource = %self.resource_key, "Circuit open, failing fast");
                    Err(self.rejection(&inner))
                }
            }
        }
    }

    fn admission(&self, trial: bool) -> Admission<'_> {
        Admission {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn rejection(&self, inner: &Inner) -> StagegateError {
        let remaining = inner
            .opened_at
            .map_or(Duration::ZERO, |at| inner.cooldown.saturating_sub(at.elapsed()));
        StagegateError::CircuitOpen {
            resource: self.resource_key.clone(),
            remaining_ms: millis(remaining),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen | BreakerState::Open => {
                info!(
                    resource = %self.resource_key,
                    trial,
                    "Call succeeded, closing circuit breaker"
                );
                self.close(&mut inner);
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trips += 1;
                    warn!(
                        resource = %self.resource_key,
                        failures = inner.consecutive_failures,
                        cooldown_ms = millis(inner.cooldown),
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen if trial => {
                let doubled = inner.cooldown.saturating_mul(2).min(self.cooldown_cap);
                inner.cooldown = doubled;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trips += 1;
                warn!(
                    resource = %self.resource_key,
                    cooldown_ms = millis(doubled),
                    "Half-open trial failed, circuit breaker re-opened"
                );
            }
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            debug!(resource = %self.resource_key, "Half-open trial abandoned");
            inner.state = BreakerState::Open;
        }
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown = self.base_cooldown;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{FnProbe, NeverProbe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config() -> BreakerConfig {
        BreakerConfig::new(5, Duration::from_secs(1800), Duration::from_secs(7200))
    }

    async fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            let _: Result<(), StagegateError> = breaker
                .call(&NeverProbe, || async {
                    Err(StagegateError::upstream("boxscores", "503"))
                })
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("boxscores", &config());

        fail_n(&breaker, 4).await;
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail_n(&breaker, 1).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_calling() {
        let breaker = CircuitBreaker::new("boxscores", &config());
        fail_n(&breaker, 5).await;

        let calls = AtomicUsize::new(0);
        let result: Result<(), StagegateError> = breaker
            .call(&NeverProbe, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(StagegateError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_closes_long_before_cooldown() {
        let breaker = CircuitBreaker::new("boxscores", &config());
        let available = Arc::new(AtomicBool::new(false));
        let flag = available.clone();
        let probe = FnProbe::new(move || flag.load(Ordering::SeqCst));

        fail_n(&breaker, 5).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        available.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;

        let result: Result<u32, StagegateError> = breaker.call(&probe, || async { Ok(7) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes_and_resets_cooldown() {
        let breaker = CircuitBreaker::new("odds", &config());
        fail_n(&breaker, 5).await;

        tokio::time::advance(Duration::from_secs(1800)).await;
        let result: Result<(), StagegateError> =
            breaker.call(&NeverProbe, || async { Ok(()) }).await;

        assert!(result.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.cooldown(), Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_doubles_cooldown_up_to_cap() {
        let breaker = CircuitBreaker::new("odds", &config());
        fail_n(&breaker, 5).await;

        tokio::time::advance(Duration::from_secs(1800)).await;
        fail_n(&breaker, 1).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.cooldown(), Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(3600)).await;
        fail_n(&breaker, 1).await;
        assert_eq!(breaker.cooldown(), Duration::from_secs(7200));

        tokio::time::advance(Duration::from_secs(7200)).await;
        fail_n(&breaker, 1).await;
        assert_eq!(breaker.cooldown(), Duration::from_secs(7200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_flight() {
        let breaker = Arc::new(CircuitBreaker::new("odds", &config()));
        fail_n(&breaker, 5).await;
        tokio::time::advance(Duration::from_secs(1800)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(&NeverProbe, || async move {
                    let _ = release_rx.await;
                    Ok::<_, StagegateError>(())
                })
                .await
        });

        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let second: Result<(), StagegateError> =
            breaker.call(&NeverProbe, || async { Ok(()) }).await;
        assert!(matches!(second, Err(StagegateError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_counted_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("scores", &config());

        for _ in 0..10 {
            let _: Result<(), StagegateError> = breaker
                .call_with(
                    &NeverProbe,
                    || async { Err(StagegateError::PermanentData("bad row".into())) },
                    StagegateError::is_upstream_failure,
                )
                .await;
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_returns_to_open() {
        let breaker = CircuitBreaker::new("odds", &config());
        fail_n(&breaker, 5).await;
        tokio::time::advance(Duration::from_secs(1800)).await;

        let pending = breaker.call(&NeverProbe, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, StagegateError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_snapshot_serializes_state() {
        let breaker = CircuitBreaker::new("odds", &config());
        let json = serde_json::to_value(breaker.snapshot()).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["cooldown_ms"], 1_800_000);
    }
}
