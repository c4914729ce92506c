use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::policy::CircuitBreakerPolicy;

/// Runtime circuit state for one downstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a downstream call succeeded. Slowness is derived from the elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit '{target}' is {state}")]
pub struct CircuitOpen {
    pub target: String,
    pub state: CircuitState,
}

/// Proof of admission. Hand it back to [`CircuitBreaker::record`] once the call finishes.
///
/// A half-open trial permit dropped without being recorded returns its trial slot.
#[derive(Debug)]
#[must_use = "an admitted call must report its outcome"]
pub struct CallPermit {
    generation: u64,
    trial: Option<Weak<Mutex<CircuitInner>>>,
}

impl CallPermit {
    fn disarm(&mut self) {
        self.trial = None;
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let Some(inner) = self.trial.take().and_then(|trial| trial.upgrade()) else {
            return;
        };

        let mut inner = inner.lock();
        if inner.generation == self.generation
            && inner.state == CircuitState::HalfOpen
            && inner.trials_admitted > 0
        {
            inner.trials_admitted -= 1;
            debug!(generation = self.generation, "unrecorded trial call released its slot");
        }
    }
}

/// Snapshot of the sliding window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    /// `None` until the window is full.
    pub failure_rate: Option<f64>,
    pub slow_call_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Recorded {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    window: VecDeque<Recorded>,
    opened_at: Option<Instant>,
    // Bumped on every transition so late outcomes from an earlier state are dropped.
    generation: u64,
    trials_admitted: u32,
    trials_succeeded: u32,
}

/// Sliding-window circuit breaker shared by every caller of one target.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        let capacity = policy.sliding_window_size.max(1);
        Self {
            name: name.into(),
            policy,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(capacity),
                opened_at: None,
                generation: 0,
                trials_admitted: 0,
                trials_succeeded: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// Admit a call or reject it without touching the downstream.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpen> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let can_probe = inner
                .opened_at
                .map(|opened_at| opened_at.elapsed() >= self.policy.open_duration)
                .unwrap_or(true);
            if !can_probe {
                return Err(self.rejection(CircuitState::Open));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                generation: inner.generation,
                trial: None,
            }),
            CircuitState::HalfOpen if inner.trials_admitted < self.policy.half_open_trial_calls => {
                inner.trials_admitted += 1;
                Ok(CallPermit {
                    generation: inner.generation,
                    trial: Some(Arc::downgrade(&self.inner)),
                })
            }
            state => Err(self.rejection(state)),
        }
    }

    /// Record a finished call and return the state it leaves the breaker in.
    pub fn record(&self, mut permit: CallPermit, outcome: CallOutcome, elapsed: Duration) -> CircuitState {
        permit.disarm();
        let sample = Recorded {
            failed: outcome == CallOutcome::Failure,
            slow: elapsed >= self.policy.slow_call_duration_threshold,
        };

        let mut inner = self.inner.lock();
        if permit.generation != inner.generation {
            return inner.state;
        }

        match inner.state {
            CircuitState::Closed => {
                self.push(&mut inner, sample);
                if self.threshold_exceeded(&inner) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.push(&mut inner, sample);
                if sample.failed || sample.slow {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    inner.trials_succeeded += 1;
                    if inner.trials_succeeded >= self.policy.half_open_trial_calls {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {}
        }

        inner.state
    }

    /// Current state. An expired open timer is reported as `HALF_OPEN`.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at))
                if opened_at.elapsed() >= self.policy.open_duration =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let state = self.state();
        let inner = self.inner.lock();
        let buffered_calls = inner.window.len();
        let failed_calls = inner.window.iter().filter(|sample| sample.failed).count();
        let slow_calls = inner.window.iter().filter(|sample| sample.slow).count();
        let full = buffered_calls >= self.policy.sliding_window_size;

        CircuitMetrics {
            state,
            buffered_calls,
            failed_calls,
            slow_calls,
            failure_rate: full.then(|| percentage(failed_calls, buffered_calls)),
            slow_call_rate: full.then(|| percentage(slow_calls, buffered_calls)),
        }
    }

    fn push(&self, inner: &mut CircuitInner, sample: Recorded) {
        if inner.window.len() >= self.policy.sliding_window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(sample);
    }

    fn threshold_exceeded(&self, inner: &CircuitInner) -> bool {
        let total = inner.window.len();
        if total < self.policy.sliding_window_size.max(1) {
            return false;
        }
        let failed = inner.window.iter().filter(|sample| sample.failed).count();
        let slow = inner.window.iter().filter(|sample| sample.slow).count();

        percentage(failed, total) >= self.policy.failure_rate_threshold
            || percentage(slow, total) >= self.policy.slow_call_rate_threshold
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.trials_admitted = 0;
        inner.trials_succeeded = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    circuit = %self.name,
                    from = %from,
                    to = %to,
                    open_ms = self.policy.open_duration.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.opened_at = None;
                info!(circuit = %self.name, from = %from, to = %to, "circuit breaker probing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
                info!(circuit = %self.name, from = %from, to = %to, "circuit breaker closed");
            }
        }
    }

    fn rejection(&self, state: CircuitState) -> CircuitOpen {
        CircuitOpen {
            target: self.name.clone(),
            state,
        }
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

/// Lazily created breakers keyed by target name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker for `target`, created with `policy` on first use.
    pub fn breaker(&self, target: &str, policy: &CircuitBreakerPolicy) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(target.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, policy.clone())));
        Arc::clone(breaker)
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(target).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitMetrics)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        breakers
            .iter()
            .map(|breaker| (breaker.name().to_owned(), breaker.metrics()))
            .collect()
    }
}
