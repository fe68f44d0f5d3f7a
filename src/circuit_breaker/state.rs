//! The circuit breaker's state machine: a reducer that turns an action
//! (a call outcome, a forced transition, a reset) plus the current state
//! into a new state and the events that transition produced.

use crate::delay::{DelayContext, DelayStrategy};
use crate::sliding_window::FailureRateWindow;
use std::time::{Duration, Instant};

/// The three states a circuit breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Calls pass through; outcomes feed the failure-rate window.
    Closed,
    /// Calls are rejected without running the operation.
    Open,
    /// A limited number of trial calls are allowed through to probe
    /// whether the dependency has recovered.
    HalfOpen,
}

/// Observable events a circuit breaker publishes on its event bus.
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    /// The state changed, e.g. `Closed -> Open` once the failure rate
    /// crossed the configured threshold.
    StateTransition {
        from: CircuitBreakerState,
        to: CircuitBreakerState,
    },
    /// A call was rejected without running because the breaker is Open, or
    /// Half-Open with no trial slots left.
    CallNotPermitted,
    /// A call (real or manually recorded) completed successfully.
    CallSucceeded,
    /// A call (real or manually recorded) completed with an error.
    CallFailed,
    /// The breaker was reset to a fresh Closed state.
    Reset,
}

/// Action dispatched into the reducer.
pub(crate) enum Action {
    RecordSuccess,
    RecordFailure,
    /// Re-evaluates timeout-driven transitions (Open's wait elapsing,
    /// Half-Open's max wait elapsing) without recording any outcome.
    ForceStateUpdate,
    TransitionTo(CircuitBreakerState),
    Reset,
}

pub(crate) struct ReducerConfig {
    pub failure_rate_threshold: f64,
    pub permitted_calls_in_half_open: u32,
    pub wait_duration_in_open_state: DelayStrategy,
    /// If non-zero, Half-Open forces back to Open once this much time has
    /// passed without the trial-call quota being reached.
    pub max_wait_duration_in_half_open: Duration,
}

pub(crate) struct ReducerState {
    state: CircuitBreakerState,
    window: FailureRateWindow,
    /// Set when entering Open; re-evaluated against
    /// `wait_duration_in_open_state` to decide whether to auto-advance to
    /// Half-Open.
    opened_at: Option<Instant>,
    /// Number of consecutive times Closed -> Open has fired since the last
    /// full reset; grows the next open-state wait via
    /// `wait_duration_in_open_state`.
    consecutive_opens: u32,
    /// Set when entering Half-Open; re-evaluated against
    /// `max_wait_duration_in_half_open`.
    half_open_entered_at: Option<Instant>,
    half_open_remaining_permits: u32,
    half_open_successes: u32,
    half_open_failures: u32,
}

impl ReducerState {
    pub fn new(window: FailureRateWindow) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            window,
            opened_at: None,
            consecutive_opens: 0,
            half_open_entered_at: None,
            half_open_remaining_permits: 0,
            half_open_successes: 0,
            half_open_failures: 0,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn consecutive_opens(&self) -> u32 {
        self.consecutive_opens
    }

    pub fn failure_rate(&self) -> f64 {
        self.window.current_failure_rate()
    }

    pub fn window_records(&self) -> u64 {
        self.window.records()
    }

    pub fn half_open_counts(&self) -> (u32, u32) {
        (self.half_open_successes, self.half_open_failures)
    }

    /// Reserves one Half-Open trial slot, if any remain. Call this before
    /// running the operation; a `false` result means reject the call.
    pub fn try_reserve_half_open_slot(&mut self) -> bool {
        if self.half_open_remaining_permits == 0 {
            return false;
        }
        self.half_open_remaining_permits -= 1;
        true
    }

    fn enter(&mut self, to: CircuitBreakerState, config: &ReducerConfig, now: Instant) {
        match to {
            CircuitBreakerState::Closed => {
                self.window.clear();
                self.consecutive_opens = 0;
                self.opened_at = None;
                self.half_open_entered_at = None;
            }
            CircuitBreakerState::Open => {
                self.consecutive_opens += 1;
                self.opened_at = Some(now);
                self.half_open_entered_at = None;
            }
            CircuitBreakerState::HalfOpen => {
                self.half_open_remaining_permits = config.permitted_calls_in_half_open;
                self.half_open_successes = 0;
                self.half_open_failures = 0;
                self.half_open_entered_at = Some(now);
            }
        }
        self.state = to;
    }

    /// Time to wait before a lazily-checked Open breaker becomes eligible
    /// for Half-Open, based on how many times it has opened in a row.
    fn open_state_wait(&self, config: &ReducerConfig) -> Duration {
        let attempt = self.consecutive_opens.max(1);
        config
            .wait_duration_in_open_state
            .compute(attempt, &DelayContext::default())
    }

    /// Evaluates the Half-Open trial quota: once `callsAttempted` reaches
    /// `permittedNumberInHalfOpen`, decides Closed vs. Open from the failure
    /// rate observed over those trials.
    fn maybe_conclude_half_open_trial(
        &mut self,
        config: &ReducerConfig,
        now: Instant,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        let attempted = self.half_open_successes + self.half_open_failures;
        if attempted < config.permitted_calls_in_half_open {
            return;
        }
        let failure_rate = self.half_open_failures as f64 / attempted.max(1) as f64;
        let to = if failure_rate >= config.failure_rate_threshold {
            CircuitBreakerState::Open
        } else {
            CircuitBreakerState::Closed
        };
        let from = self.state;
        self.enter(to, config, now);
        events.push(CircuitBreakerEvent::StateTransition { from, to });
    }

    fn force_state_update(&mut self, config: &ReducerConfig, now: Instant, events: &mut Vec<CircuitBreakerEvent>) {
        match self.state {
            CircuitBreakerState::Open => {
                if let Some(opened_at) = self.opened_at {
                    if now.saturating_duration_since(opened_at) >= self.open_state_wait(config) {
                        let from = self.state;
                        self.enter(CircuitBreakerState::HalfOpen, config, now);
                        events.push(CircuitBreakerEvent::StateTransition {
                            from,
                            to: CircuitBreakerState::HalfOpen,
                        });
                    }
                }
            }
            CircuitBreakerState::HalfOpen => {
                if config.max_wait_duration_in_half_open.is_zero() {
                    return;
                }
                if let Some(entered_at) = self.half_open_entered_at {
                    if now.saturating_duration_since(entered_at)
                        >= config.max_wait_duration_in_half_open
                    {
                        let from = self.state;
                        self.enter(CircuitBreakerState::Open, config, now);
                        events.push(CircuitBreakerEvent::StateTransition {
                            from,
                            to: CircuitBreakerState::Open,
                        });
                    }
                }
            }
            CircuitBreakerState::Closed => {}
        }
    }

    pub(crate) fn dispatch(
        &mut self,
        action: Action,
        config: &ReducerConfig,
        now: Instant,
    ) -> Vec<CircuitBreakerEvent> {
        let mut events = Vec::new();
        match action {
            Action::RecordSuccess => match self.state {
                CircuitBreakerState::Closed => {
                    self.window.record_success();
                    events.push(CircuitBreakerEvent::CallSucceeded);
                }
                CircuitBreakerState::HalfOpen => {
                    self.half_open_successes += 1;
                    events.push(CircuitBreakerEvent::CallSucceeded);
                    self.maybe_conclude_half_open_trial(config, now, &mut events);
                }
                CircuitBreakerState::Open => {
                    // A call outcome recorded against an Open breaker (e.g.
                    // a race with the transition) doesn't affect state.
                    events.push(CircuitBreakerEvent::CallSucceeded);
                }
            },
            Action::RecordFailure => match self.state {
                CircuitBreakerState::Closed => {
                    self.window.record_failure();
                    events.push(CircuitBreakerEvent::CallFailed);
                    if self.window.current_failure_rate() >= config.failure_rate_threshold {
                        let from = self.state;
                        self.enter(CircuitBreakerState::Open, config, now);
                        events.push(CircuitBreakerEvent::StateTransition {
                            from,
                            to: CircuitBreakerState::Open,
                        });
                    }
                }
                CircuitBreakerState::HalfOpen => {
                    self.half_open_failures += 1;
                    events.push(CircuitBreakerEvent::CallFailed);
                    self.maybe_conclude_half_open_trial(config, now, &mut events);
                }
                CircuitBreakerState::Open => {
                    events.push(CircuitBreakerEvent::CallFailed);
                }
            },
            Action::ForceStateUpdate => {
                self.force_state_update(config, now, &mut events);
            }
            Action::TransitionTo(to) => {
                let from = self.state;
                if from != to {
                    self.enter(to, config, now);
                    events.push(CircuitBreakerEvent::StateTransition { from, to });
                }
            }
            Action::Reset => {
                let from = self.state;
                self.enter(CircuitBreakerState::Closed, config, now);
                if from != CircuitBreakerState::Closed {
                    events.push(CircuitBreakerEvent::StateTransition {
                        from,
                        to: CircuitBreakerState::Closed,
                    });
                }
                events.push(CircuitBreakerEvent::Reset);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReducerConfig {
        ReducerConfig {
            failure_rate_threshold: 0.5,
            permitted_calls_in_half_open: 2,
            wait_duration_in_open_state: DelayStrategy::constant(Duration::from_secs(1), 0.0)
                .unwrap(),
            max_wait_duration_in_half_open: Duration::ZERO,
        }
    }

    fn window() -> FailureRateWindow {
        FailureRateWindow::new(4, 4).unwrap()
    }

    #[test]
    fn closed_opens_once_failure_rate_crosses_threshold() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        for _ in 0..3 {
            state.dispatch(Action::RecordFailure, &config, now);
        }
        assert_eq!(state.state(), CircuitBreakerState::Closed);
        let events = state.dispatch(Action::RecordFailure, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::Open);
        assert!(events.iter().any(|e| matches!(
            e,
            CircuitBreakerEvent::StateTransition {
                to: CircuitBreakerState::Open,
                ..
            }
        )));
    }

    #[test]
    fn half_open_stays_open_until_the_full_trial_quota_is_attempted() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        state.dispatch(Action::TransitionTo(CircuitBreakerState::HalfOpen), &config, now);
        assert!(state.try_reserve_half_open_slot());
        // One failure out of a quota of two must not conclude the trial yet.
        state.dispatch(Action::RecordFailure, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_when_trial_calls_mostly_succeed() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        state.dispatch(Action::TransitionTo(CircuitBreakerState::HalfOpen), &config, now);
        assert!(state.try_reserve_half_open_slot());
        state.dispatch(Action::RecordSuccess, &config, now);
        assert!(state.try_reserve_half_open_slot());
        let events = state.dispatch(Action::RecordSuccess, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::Closed);
        assert!(events.iter().any(|e| matches!(
            e,
            CircuitBreakerEvent::StateTransition {
                to: CircuitBreakerState::Closed,
                ..
            }
        )));
    }

    #[test]
    fn half_open_reopens_once_trial_quota_reached_with_high_failure_rate() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        state.dispatch(Action::TransitionTo(CircuitBreakerState::HalfOpen), &config, now);
        assert!(state.try_reserve_half_open_slot());
        state.dispatch(Action::RecordSuccess, &config, now);
        assert!(state.try_reserve_half_open_slot());
        let events = state.dispatch(Action::RecordFailure, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::Open);
        assert!(events.iter().any(|e| matches!(
            e,
            CircuitBreakerEvent::StateTransition {
                to: CircuitBreakerState::Open,
                ..
            }
        )));
    }

    #[test]
    fn force_state_update_advances_open_to_half_open_once_wait_elapses() {
        let mut state = ReducerState::new(window());
        let config = config();
        let t0 = Instant::now();
        for _ in 0..4 {
            state.dispatch(Action::RecordFailure, &config, t0);
        }
        assert_eq!(state.state(), CircuitBreakerState::Open);
        state.dispatch(Action::ForceStateUpdate, &config, t0);
        assert_eq!(state.state(), CircuitBreakerState::Open);
        let later = t0 + Duration::from_secs(2);
        state.dispatch(Action::ForceStateUpdate, &config, later);
        assert_eq!(state.state(), CircuitBreakerState::HalfOpen);
    }

    #[test]
    fn force_state_update_is_idempotent_with_no_elapsed_time() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        for _ in 0..4 {
            state.dispatch(Action::RecordFailure, &config, now);
        }
        assert_eq!(state.state(), CircuitBreakerState::Open);
        let events = state.dispatch(Action::ForceStateUpdate, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::Open);
        assert!(events.is_empty());
    }

    #[test]
    fn half_open_max_wait_forces_back_to_open_if_quota_never_fills() {
        let mut state = ReducerState::new(window());
        let mut config = config();
        config.max_wait_duration_in_half_open = Duration::from_millis(50);
        let t0 = Instant::now();
        state.dispatch(Action::TransitionTo(CircuitBreakerState::HalfOpen), &config, t0);
        assert!(state.try_reserve_half_open_slot());
        // Only one of the two trial slots used; the quota never fills.
        let later = t0 + Duration::from_millis(100);
        state.dispatch(Action::ForceStateUpdate, &config, later);
        assert_eq!(state.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn reset_returns_to_closed_and_clears_window() {
        let mut state = ReducerState::new(window());
        let config = config();
        let now = Instant::now();
        for _ in 0..4 {
            state.dispatch(Action::RecordFailure, &config, now);
        }
        assert_eq!(state.state(), CircuitBreakerState::Open);
        state.dispatch(Action::Reset, &config, now);
        assert_eq!(state.state(), CircuitBreakerState::Closed);
        assert_eq!(state.consecutive_opens(), 0);
    }
}
