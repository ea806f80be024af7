//! Retry, circuit breaker and timeout around one dependency.
//!
//! Every outbound call a collector makes, and every store write the
//! materializer makes, goes through a [`ResilienceWrapper`]:
//!
//! 1. The breaker gates the call. While open, the call fails with
//!    `CircuitOpen` and the operation is never invoked.
//! 2. Each attempt runs under a timeout; an elapsed deadline is a `Timeout`.
//! 3. Transient failures are retried with backoff. A half-open trial is a
//!    single attempt.
//! 4. The breaker records one outcome per logical call, after retries. A
//!    half-open trial that panics or is dropped counts as a failed trial.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::collector::SourceError;
use crate::retry::RetryPolicy;

/// Settings for one wrapper instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Reopens the breaker if a half-open trial is unwound or cancelled before
/// it records an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// Resilience wrapper around one named dependency.
#[derive(Debug, Clone)]
pub struct ResilienceWrapper {
    name: Arc<str>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    attempts: Arc<AtomicU64>,
}

impl ResilienceWrapper {
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Self {
        let name: String = name.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), config.breaker)),
            name: Arc::from(name),
            retry: config.retry,
            attempt_timeout: config.attempt_timeout,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Attempts made through this wrapper, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let admission = self.breaker.try_acquire();
        if admission == Admission::Rejected {
            return Err(SourceError::circuit_open(&self.name));
        }
        let mut trial = TrialGuard {
            breaker: &self.breaker,
            armed: admission == Admission::Trial,
        };

        let mut attempt = 0_u32;
        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let outcome = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SourceError::timeout(format!(
                    "'{}' attempt exceeded {}ms",
                    self.name,
                    self.attempt_timeout.as_millis()
                ))),
            };

            let error = match outcome {
                Ok(value) => {
                    trial.settle();
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            if admission == Admission::Allowed && self.retry.should_retry(error.kind(), attempt) {
                let delay = self.retry.delay_for(error.kind(), attempt);
                tracing::warn!(
                    dependency = %self.name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    code = error.code(),
                    error = %error.message(),
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            trial.settle();
            if error.kind().trips_breaker() {
                self.breaker.record_failure();
            } else {
                self.breaker.record_success();
            }
            return Err(error);
        }
    }
}
