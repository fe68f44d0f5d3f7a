//! Circuit breaker: stops calling a dependency once it's failing often
//! enough to matter, and periodically lets a few trial calls through to
//! check whether it has recovered.

mod state;

pub use state::{CircuitBreakerEvent, CircuitBreakerState};

use crate::clock::{system_clock, Clock};
use crate::delay::DelayStrategy;
use crate::error::{CircuitBreakerError, InvalidArgument};
use crate::event::{EventBus, SubscriptionId};
use crate::sliding_window::FailureRateWindow;
use parking_lot::Mutex;
use state::{Action, ReducerConfig, ReducerState};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type ExceptionPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Configuration for a [`CircuitBreaker`].
///
/// Generic over the guarded operation's success type `T` and error type `E`
/// because `record_result_predicate`/`record_exception_predicate` need to
/// inspect values of those types.
pub struct CircuitBreakerConfig<T, E> {
    /// Fraction of failures (in `[0.0, 1.0]`) in the sliding window, or
    /// among Half-Open trial calls, that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Size of the Closed-state failure rate window.
    pub sliding_window_size: usize,
    /// Minimum number of calls in the window before `failure_rate_threshold`
    /// is even evaluated.
    pub minimum_throughput: u64,
    /// How long an Open breaker waits before becoming eligible for
    /// Half-Open. Escalates with consecutive re-opens when given a
    /// non-constant strategy.
    pub wait_duration_in_open_state: DelayStrategy,
    /// Number of trial calls allowed through while Half-Open.
    pub permitted_calls_in_half_open: u32,
    /// If non-zero, forces Half-Open back to Open once this much time has
    /// passed without the trial quota being attempted.
    pub max_wait_duration_in_half_open_state: Duration,
    /// Classifies an operation error as a recorded failure (`true`) or as
    /// ignorable for circuit-tripping purposes (`false`), though the error
    /// is always still returned to the caller. `None` treats every error as
    /// a failure.
    pub record_exception_predicate: Option<ExceptionPredicate<E>>,
    /// Classifies a successful result as a recorded failure (`true`). `None`
    /// treats every `Ok` as a success.
    pub record_result_predicate: Option<ResultPredicate<T>>,
}

impl<T, E> fmt::Debug for CircuitBreakerConfig<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("minimum_throughput", &self.minimum_throughput)
            .field("wait_duration_in_open_state", &self.wait_duration_in_open_state)
            .field("permitted_calls_in_half_open", &self.permitted_calls_in_half_open)
            .field(
                "max_wait_duration_in_half_open_state",
                &self.max_wait_duration_in_half_open_state,
            )
            .finish_non_exhaustive()
    }
}

impl<T, E> CircuitBreakerConfig<T, E> {
    /// Builds a config with no Half-Open max-wait and no outcome predicates
    /// (every `Err` counts as a failure, every `Ok` as a success).
    pub fn new(
        failure_rate_threshold: f64,
        sliding_window_size: usize,
        minimum_throughput: u64,
        wait_duration_in_open_state: DelayStrategy,
        permitted_calls_in_half_open: u32,
    ) -> Self {
        Self {
            failure_rate_threshold,
            sliding_window_size,
            minimum_throughput,
            wait_duration_in_open_state,
            permitted_calls_in_half_open,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            record_exception_predicate: None,
            record_result_predicate: None,
        }
    }

    /// Forces Half-Open back to Open once `duration` elapses without the
    /// trial quota being attempted.
    pub fn max_wait_duration_in_half_open_state(mut self, duration: Duration) -> Self {
        self.max_wait_duration_in_half_open_state = duration;
        self
    }

    /// Classifies operation errors; only ones this returns `true` for are
    /// recorded as failures (the error is still always returned to the
    /// caller).
    pub fn record_exception_predicate(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.record_exception_predicate = Some(Arc::new(predicate));
        self
    }

    /// Classifies successful results; ones this returns `true` for are
    /// recorded as failures despite being `Ok`.
    pub fn record_result_predicate(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.record_result_predicate = Some(Arc::new(predicate));
        self
    }

    fn validate(&self) -> Result<(), InvalidArgument> {
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(InvalidArgument::new(
                "failure_rate_threshold must be in [0, 1]",
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(InvalidArgument::new("sliding_window_size must be positive"));
        }
        if self.minimum_throughput == 0 {
            return Err(InvalidArgument::new("minimum_throughput must be positive"));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(InvalidArgument::new(
                "permitted_calls_in_half_open must be positive",
            ));
        }
        Ok(())
    }
}

/// Read-only snapshot of a breaker's current bookkeeping, for an embedding
/// application to expose on its own health/metrics surface.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    /// Failure rate over the Closed-state sliding window (`0.0` if Open or
    /// Half-Open, or if the minimum throughput gate hasn't been met).
    pub failure_rate: f64,
    /// Total outcomes recorded in the current Closed-state window cycle.
    pub window_records: u64,
    /// `(successes, failures)` observed among the current Half-Open trial
    /// calls; `(0, 0)` outside Half-Open.
    pub half_open_trial_counts: (u32, u32),
    pub consecutive_opens: u32,
}

/// Protects calls to an unreliable dependency by tripping Open once it
/// fails often enough, and probing recovery through a limited number of
/// Half-Open trial calls.
pub struct CircuitBreaker<T, E> {
    reducer_config: ReducerConfig,
    state: Mutex<ReducerState>,
    clock: Arc<dyn Clock>,
    events: EventBus<CircuitBreakerEvent>,
    record_exception_predicate: Option<ExceptionPredicate<E>>,
    record_result_predicate: Option<ResultPredicate<T>>,
}

impl<T, E> CircuitBreaker<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Fails if `config` doesn't pass validation.
    pub fn new(config: CircuitBreakerConfig<T, E>) -> Result<Self, InvalidArgument> {
        Self::with_clock(config, system_clock())
    }

    pub(crate) fn with_clock(
        config: CircuitBreakerConfig<T, E>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InvalidArgument> {
        config.validate()?;
        let window = FailureRateWindow::new(config.sliding_window_size, config.minimum_throughput)?;
        Ok(Self {
            reducer_config: ReducerConfig {
                failure_rate_threshold: config.failure_rate_threshold,
                permitted_calls_in_half_open: config.permitted_calls_in_half_open,
                wait_duration_in_open_state: config.wait_duration_in_open_state,
                max_wait_duration_in_half_open: config.max_wait_duration_in_half_open_state,
            },
            state: Mutex::new(ReducerState::new(window)),
            clock,
            events: EventBus::new(),
            record_exception_predicate: config.record_exception_predicate,
            record_result_predicate: config.record_result_predicate,
        })
    }

    fn publish(&self, events: Vec<CircuitBreakerEvent>) {
        for event in &events {
            if let CircuitBreakerEvent::StateTransition { from, to } = event {
                match to {
                    CircuitBreakerState::Open => {
                        tracing::warn!(?from, ?to, "circuit breaker opened");
                    }
                    CircuitBreakerState::Closed => {
                        tracing::info!(?from, ?to, "circuit breaker closed");
                    }
                    CircuitBreakerState::HalfOpen => {
                        tracing::debug!(?from, ?to, "circuit breaker half-open");
                    }
                }
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    /// The breaker's current state, lazily advancing Open -> HalfOpen or
    /// forcing HalfOpen -> Open as the relevant waits elapse.
    pub fn current_state(&self) -> CircuitBreakerState {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::ForceStateUpdate, &self.reducer_config, now);
        let result = state.state();
        drop(state);
        self.publish(events);
        result
    }

    /// Gate check: re-evaluates timeout-driven transitions, then either
    /// admits the call (reserving a Half-Open trial slot if applicable) or
    /// rejects with [`CircuitBreakerError::CallNotPermitted`].
    pub fn wire(&self) -> Result<(), CircuitBreakerError<Infallible>> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::ForceStateUpdate, &self.reducer_config, now);
        let admitted = match state.state() {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => false,
            CircuitBreakerState::HalfOpen => state.try_reserve_half_open_slot(),
        };
        drop(state);
        self.publish(events);
        if admitted {
            Ok(())
        } else {
            tracing::debug!("circuit breaker call not permitted");
            self.events.emit(CircuitBreakerEvent::CallNotPermitted);
            Err(CircuitBreakerError::CallNotPermitted)
        }
    }

    /// Runs `operation` if the breaker currently permits it (see [`Self::wire`]),
    /// recording the outcome per the configured predicates.
    pub async fn execute_operation<F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.wire().map_err(|_| CircuitBreakerError::CallNotPermitted)?;

        match operation().await {
            Ok(value) => {
                let counts_as_failure = self
                    .record_result_predicate
                    .as_ref()
                    .is_some_and(|predicate| predicate(&value));
                if counts_as_failure {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Ok(value)
            }
            Err(error) => {
                let is_failure = self
                    .record_exception_predicate
                    .as_ref()
                    .map_or(true, |predicate| predicate(&error));
                if is_failure {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Manually records a success, as if a call made outside
    /// `execute_operation` had succeeded.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::RecordSuccess, &self.reducer_config, now);
        drop(state);
        self.publish(events);
    }

    /// Manually records a failure, as if a call made outside
    /// `execute_operation` had failed.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::RecordFailure, &self.reducer_config, now);
        drop(state);
        self.publish(events);
    }

    fn transition_to(&self, to: CircuitBreakerState) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::TransitionTo(to), &self.reducer_config, now);
        drop(state);
        self.publish(events);
    }

    /// Forces the breaker Open regardless of the failure-rate bookkeeping.
    pub fn transition_to_open(&self) {
        self.transition_to(CircuitBreakerState::Open);
    }

    /// Forces the breaker Half-Open, resetting the trial-call quota.
    pub fn transition_to_half_open(&self) {
        self.transition_to(CircuitBreakerState::HalfOpen);
    }

    /// Forces the breaker Closed, clearing the failure window.
    pub fn transition_to_closed(&self) {
        self.transition_to(CircuitBreakerState::Closed);
    }

    /// Resets to a fresh Closed state, clearing the failure window and any
    /// escalated open-state wait.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::Reset, &self.reducer_config, now);
        drop(state);
        self.publish(events);
    }

    /// A read-only snapshot of the breaker's current bookkeeping.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let events = state.dispatch(Action::ForceStateUpdate, &self.reducer_config, now);
        let snapshot = CircuitBreakerStats {
            state: state.state(),
            failure_rate: state.failure_rate(),
            window_records: state.window_records(),
            half_open_trial_counts: state.half_open_counts(),
            consecutive_opens: state.consecutive_opens(),
        };
        drop(state);
        self.publish(events);
        snapshot
    }

    /// Subscribes to this breaker's events. See [`EventBus::subscribe`].
    pub fn on_event<Handler>(&self, handler: Handler) -> SubscriptionId
    where
        Handler: FnMut(CircuitBreakerEvent) + Send + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Cancels all current subscribers without affecting the breaker
    /// itself.
    pub fn cancel_listeners(&self) {
        self.events.cancel_listeners();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn config() -> CircuitBreakerConfig<(), &'static str> {
        CircuitBreakerConfig::new(
            0.5,
            4,
            4,
            DelayStrategy::constant(Duration::from_millis(100), 0.0).unwrap(),
            2,
        )
    }

    #[tokio::test]
    async fn opens_after_failure_rate_crosses_threshold() {
        let breaker = CircuitBreaker::new(config()).unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);
        let err = breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::CallNotPermitted));
    }

    #[tokio::test]
    async fn half_open_trial_success_closes_the_breaker() {
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::with_clock(config(), clock.clone()).unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);

        clock.advance(Duration::from_millis(150));
        assert_eq!(breaker.current_state(), CircuitBreakerState::HalfOpen);

        breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.current_state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_waits_for_the_full_trial_quota_before_deciding() {
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::with_clock(config(), clock.clone()).unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        clock.advance(Duration::from_millis(150));
        assert_eq!(breaker.current_state(), CircuitBreakerState::HalfOpen);

        let _ = breaker
            .execute_operation(|| async { Err::<(), _>("still broken") })
            .await;
        // Quota is 2; only one trial has run so the breaker stays Half-Open.
        assert_eq!(breaker.current_state(), CircuitBreakerState::HalfOpen);

        let _ = breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await;
        // 1 failure / 2 trials = 0.5 >= threshold 0.5: reopens.
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_max_wait_forces_reopen_without_a_full_quota() {
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::with_clock(
            config().max_wait_duration_in_half_open_state(Duration::from_millis(50)),
            clock.clone(),
        )
        .unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        clock.advance(Duration::from_millis(150));
        assert_eq!(breaker.current_state(), CircuitBreakerState::HalfOpen);

        breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        clock.advance(Duration::from_millis(75));
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn record_result_predicate_can_classify_a_success_as_a_failure() {
        let breaker: CircuitBreaker<u32, &str> = CircuitBreaker::new(
            config().record_result_predicate(|v: &u32| *v >= 500),
        )
        .unwrap();
        for _ in 0..4 {
            let _ = breaker.execute_operation(|| async { Ok::<_, &str>(503u32) }).await;
        }
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn record_exception_predicate_can_ignore_an_error() {
        let breaker: CircuitBreaker<(), &str> = CircuitBreaker::new(
            config().record_exception_predicate(|e: &&str| *e != "ignore me"),
        )
        .unwrap();
        for _ in 0..4 {
            let result = breaker
                .execute_operation(|| async { Err::<(), _>("ignore me") })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Operation("ignore me"))));
        }
        // Every failure was ignored for circuit-tripping purposes.
        assert_eq!(breaker.current_state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed_and_clears_history() {
        let breaker = CircuitBreaker::new(config()).unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        assert_eq!(breaker.current_state(), CircuitBreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.current_state(), CircuitBreakerState::Closed);
        breaker
            .execute_operation(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stats_reports_failure_rate_and_state() {
        let breaker = CircuitBreaker::new(config()).unwrap();
        for _ in 0..4 {
            let _ = breaker
                .execute_operation(|| async { Err::<(), _>("boom") })
                .await;
        }
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitBreakerState::Open);
        assert_eq!(stats.consecutive_opens, 1);
    }

    #[test]
    fn rejects_bad_configuration() {
        let bad = CircuitBreakerConfig::new(
            1.5,
            4,
            4,
            DelayStrategy::constant(Duration::from_millis(100), 0.0).unwrap(),
            2,
        );
        assert!(CircuitBreaker::new(bad).is_err());
    }
}
