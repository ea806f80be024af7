use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::collector::SourceError;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-source outbound request budget.
///
/// An exhausted budget surfaces as `RateLimited`, so the resilience wrapper
/// backs off exactly as it would for an upstream 429.
#[derive(Clone)]
pub struct RequestBudget {
    limiter: Arc<DirectRateLimiter>,
    clock: DefaultClock,
    rejected: Arc<AtomicU64>,
}

impl RequestBudget {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::direct(quota_from_window(window, limit))),
            clock: DefaultClock::default(),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(Duration::from_secs(60), limit)
    }

    pub fn try_acquire(&self, source: &str) -> Result<(), SourceError> {
        match self.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let wait = not_until.wait_time_from(self.clock.now());
                Err(SourceError::rate_limited(format!(
                    "request budget for '{source}' exhausted; next slot in {}ms",
                    wait.as_millis()
                )))
            }
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RequestBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBudget")
            .field("rejected", &self.rejected())
            .finish_non_exhaustive()
    }
}

fn quota_from_window(window: Duration, limit: u32) -> Quota {
    let burst = NonZeroU32::new(limit.max(1)).unwrap_or(NonZeroU32::MIN);
    let seconds_per_cell = (window.as_secs_f64() / f64::from(burst.get())).max(0.001);

    Quota::with_period(Duration::from_secs_f64(seconds_per_cell))
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SourceErrorKind;

    #[test]
    fn exhausted_budget_is_rate_limited() {
        let budget = RequestBudget::per_minute(2);

        assert!(budget.try_acquire("price").is_ok());
        assert!(budget.try_acquire("price").is_ok());

        let error = budget.try_acquire("price").expect_err("third request exceeds budget");
        assert_eq!(error.kind(), SourceErrorKind::RateLimited);
        assert!(error.retryable());
        assert_eq!(budget.rejected(), 1);
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let budget = RequestBudget::per_minute(0);
        assert!(budget.try_acquire("macro").is_ok());
        assert!(budget.try_acquire("macro").is_err());
    }
}
