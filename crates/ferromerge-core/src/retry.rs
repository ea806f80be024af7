//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use crate::collector::SourceErrorKind;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * factor^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Scale each delay by a random factor in `[0.5, 1.0]`.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500))
    }
}

impl Backoff {
    /// Doubling backoff from `base`, capped at 64 times the base, with jitter.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            factor: 2.0,
            max: base.saturating_mul(64),
            jitter: true,
        }
    }

    /// Delay before the retry following `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = Duration::from_secs_f64(seconds.min(max.as_secs_f64()));
                if jitter {
                    capped.mul_f64(0.5 + fastrand::f64() * 0.5)
                } else {
                    capped
                }
            }
        }
    }
}

/// Bounded retry for transient failure classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Extra scaling applied to the delay after a `RateLimited` failure.
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            rate_limit_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::exponential(base),
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether a failure of `kind` on `attempt` (0-based) gets another try.
    pub fn should_retry(&self, kind: SourceErrorKind, attempt: u32) -> bool {
        kind.is_transient() && attempt < self.max_retries
    }

    pub fn delay_for(&self, kind: SourceErrorKind, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if kind == SourceErrorKind::RateLimited {
            delay.saturating_mul(self.rate_limit_multiplier.max(1))
        } else {
            delay
        }
    }
}
