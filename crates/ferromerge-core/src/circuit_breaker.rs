use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Runtime circuit state for one guarded dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Initial open window before a trial call is admitted.
    pub cooldown: Duration,
    /// Ceiling for the cooldown after repeated failed trials.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call.
    Trial,
    Rejected,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    pub transitions: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    transitions: u64,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: config.cooldown,
                trial_in_flight: false,
                transitions: 0,
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_acquire(&self) -> Admission {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => Admission::Rejected,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= inner.cooldown);
                if cooled_down && !inner.trial_in_flight {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.opened_at = None;
            inner.cooldown = self.config.cooldown;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.cooldown = inner
                    .cooldown
                    .saturating_mul(2)
                    .min(self.config.max_cooldown);
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Settle a half-open trial that ended without an outcome (panicked or was
    /// dropped) as a failed trial. No-op unless a trial is in flight.
    pub fn abandon_trial(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != CircuitState::HalfOpen || !inner.trial_in_flight {
            return;
        }
        drop(inner);
        tracing::warn!(breaker = %self.name, "half-open trial abandoned; reopening");
        self.record_failure();
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_ms: u64::try_from(inner.cooldown.as_millis()).unwrap_or(u64::MAX),
            transitions: inner.transitions,
        }
    }

    fn transition(&self, inner: &mut CircuitInner, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        inner.transitions = inner.transitions.saturating_add(1);
        match next {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                ?previous,
                failures = inner.consecutive_failures,
                cooldown_ms = inner.cooldown.as_millis() as u64,
                "circuit opened"
            ),
            _ => tracing::info!(breaker = %self.name, ?previous, state = ?next, "circuit transition"),
        }
    }
}
