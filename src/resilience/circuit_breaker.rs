//! Circuit breakers for the decision oracle and each backend.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: target assumed down, calls fail fast without I/O
//! - Half-Open: a bounded number of trial calls probe for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: cooldown elapsed, next caller becomes the trial
//! Half-Open → Closed: trial succeeds
//! Half-Open → Open: trial fails (cooldown restarts)
//! ```
//!
//! State lives behind a `std::sync::Mutex`; no lock is held across I/O.
//! Callers take a [`BreakerPermit`] before the attempt and settle it with
//! the outcome afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Returned when a breaker refuses an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub target: String,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

/// Failure-counting breaker for a single target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    cooldown: Duration,
    half_open_trials: u32,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            half_open_trials: config.half_open_trials.max(1),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_in_flight: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Whether `try_acquire` would currently succeed. Used to skip targets
    /// during selection; the permit itself is still taken with `try_acquire`.
    pub fn allows_attempt(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(&inner),
            CircuitState::HalfOpen => inner.trials_in_flight < self.half_open_trials,
        }
    }

    /// Take a permit for one attempt, or fail fast.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpen> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open if self.cooldown_elapsed(&inner) => {
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trials_in_flight = 1;
                true
            }
            CircuitState::HalfOpen if inner.trials_in_flight < self.half_open_trials => {
                inner.trials_in_flight += 1;
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                return Err(CircuitOpen {
                    target: self.target.clone(),
                })
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map_or(true, |opened| opened.elapsed() >= self.cooldown)
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if inner.state == CircuitState::HalfOpen {
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if inner.state == CircuitState::HalfOpen {
                self.trip(&mut inner);
            }
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.failure_threshold {
                self.trip(&mut inner);
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
    }

    fn trip(&self, inner: &mut BreakerState) {
        inner.opened_at = Some(Instant::now());
        self.transition(inner, CircuitState::Open);
        tracing::warn!(
            target_name = %self.target,
            consecutive_failures = inner.consecutive_failures,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitState) {
        if inner.state == next {
            return;
        }
        tracing::info!(
            target_name = %self.target,
            from = inner.state.as_str(),
            to = next.as_str(),
            "Circuit breaker transition"
        );
        inner.state = next;
        if next == CircuitState::Closed {
            inner.opened_at = None;
            inner.trials_in_flight = 0;
        }
        metrics::record_circuit_state(&self.target, next);
    }
}

/// Admission for one attempt against a target.
///
/// Settle with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping an unsettled permit (the call was cancelled, or the failure was
/// not the target's fault) frees any trial slot without a transition.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Breakers keyed by target name, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, &self.config)))
            .value()
            .clone()
    }
}
