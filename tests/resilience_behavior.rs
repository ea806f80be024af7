//! Behavior-driven tests for the resilience wrapper
//!
//! All tests run on a paused clock so backoff and cooldown windows are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ferromerge_core::{
    Backoff, CircuitBreakerConfig, CircuitState, ResilienceConfig, ResilienceWrapper,
    RetryPolicy, SourceError, SourceErrorKind,
};
use tokio::time::Instant;

fn wrapper(retry: RetryPolicy, threshold: u32) -> ResilienceWrapper {
    ResilienceWrapper::new(
        "macro-api",
        ResilienceConfig {
            retry,
            breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
                max_cooldown: Duration::from_secs(100),
            },
            attempt_timeout: Duration::from_secs(2),
        },
    )
}

async fn fail_with(wrapper: &ResilienceWrapper, calls: &AtomicUsize, error: SourceError) -> SourceError {
    wrapper
        .call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            async move { Err::<(), _>(error) }
        })
        .await
        .expect_err("operation fails")
}

// =============================================================================
// Breaker opening and fail-fast
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_f_consecutive_calls_fail_the_breaker_opens_on_the_fth() {
    // Given: A threshold of 5 and no retries
    let wrapper = wrapper(RetryPolicy::no_retry(), 5);
    let calls = AtomicUsize::new(0);

    // When: Four calls fail
    for _ in 0..4 {
        fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
    }

    // Then: The breaker is still closed
    assert_eq!(wrapper.circuit().state, CircuitState::Closed);
    assert_eq!(wrapper.circuit().consecutive_failures, 4);

    // When: The fifth call fails
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;

    // Then: It opens
    assert_eq!(wrapper.circuit().state, CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn when_the_breaker_is_open_calls_fail_fast_without_invoking_the_operation() {
    // Given: An open breaker
    let wrapper = wrapper(RetryPolicy::no_retry(), 1);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;

    // When: Another call arrives inside the cooldown
    let started = Instant::now();
    let error = fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;

    // Then: CircuitOpen, immediately, with no upstream work
    assert_eq!(error.kind(), SourceErrorKind::CircuitOpen);
    assert!(!error.retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn when_retries_are_exhausted_the_breaker_counts_one_failure() {
    // Given: Three retries per call
    let wrapper = wrapper(RetryPolicy::fixed(Duration::from_millis(50), 3), 5);
    let calls = AtomicUsize::new(0);

    // When: A call fails on every attempt
    let error = fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;

    // Then: Four attempts, one breaker failure
    assert_eq!(error.kind(), SourceErrorKind::SourceUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(wrapper.attempts(), 4);
    assert_eq!(wrapper.circuit().consecutive_failures, 1);
}

// =============================================================================
// Half-open trial
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_cooldown_elapses_exactly_one_concurrent_caller_gets_the_trial() {
    // Given: An open breaker whose cooldown has elapsed
    let wrapper = wrapper(RetryPolicy::no_retry(), 1);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    // When: Two callers race, the trial taking a second to answer
    let slow_success = || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, SourceError>("ok")
        }
    };
    let (first, second) = tokio::join!(wrapper.call(slow_success), wrapper.call(slow_success));

    // Then: One trial ran and succeeded, the other was rejected
    assert_eq!(first, Ok("ok"));
    assert_eq!(
        second.expect_err("rejected while half-open").kind(),
        SourceErrorKind::CircuitOpen
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(wrapper.circuit().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn when_trials_keep_failing_the_cooldown_doubles_up_to_the_ceiling() {
    // Given: An open breaker with a 30s cooldown and a 100s ceiling
    let wrapper = wrapper(RetryPolicy::fixed(Duration::from_millis(10), 3), 1);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
    let baseline = calls.load(Ordering::SeqCst);

    // When / Then: Each failed trial doubles the window, capped at 100s
    let mut cooldown = Duration::from_secs(30);
    for expected_ms in [60_000, 100_000, 100_000] {
        tokio::time::advance(cooldown).await;
        fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
        let circuit = wrapper.circuit();
        assert_eq!(circuit.state, CircuitState::Open);
        assert_eq!(circuit.cooldown_ms, expected_ms);
        cooldown = Duration::from_millis(expected_ms);
    }

    // And: Each trial was a single attempt despite the retry budget
    assert_eq!(calls.load(Ordering::SeqCst), baseline + 3);
}

fn normalizer_bug() -> Result<(), SourceError> {
    panic!("normalizer bug");
}

#[tokio::test(start_paused = true)]
async fn when_a_half_open_trial_panics_the_breaker_reopens_and_recovers_later() {
    // Given: An open breaker whose cooldown has elapsed
    let wrapper = wrapper(RetryPolicy::no_retry(), 1);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    // When: The trial call panics inside a spawned run
    let trial = wrapper.clone();
    let joined = tokio::spawn(async move { trial.call(|| async { normalizer_bug() }).await }).await;

    // Then: The panic surfaces to the task owner and the trial counts as failed
    assert!(joined.expect_err("trial panicked").is_panic());
    let circuit = wrapper.circuit();
    assert_eq!(circuit.state, CircuitState::Open);
    assert_eq!(circuit.cooldown_ms, 60_000);

    // And: After the doubled cooldown, a new trial is admitted and closes it
    tokio::time::advance(Duration::from_secs(60)).await;
    let value = wrapper
        .call(|| async { Ok::<_, SourceError>("recovered") })
        .await
        .expect("second trial");
    assert_eq!(value, "recovered");
    assert_eq!(wrapper.circuit().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn when_a_half_open_trial_is_cancelled_the_next_cooldown_admits_another() {
    // Given: An open breaker whose cooldown has elapsed
    let wrapper = wrapper(RetryPolicy::no_retry(), 1);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    // When: The caller gives up on a hanging trial before it answers
    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        wrapper.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, SourceError>(())
        }),
    )
    .await;

    // Then: The breaker is open again rather than stuck half-open
    assert!(abandoned.is_err());
    assert_eq!(wrapper.circuit().state, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(60)).await;
    wrapper
        .call(|| async { Ok::<_, SourceError>(()) })
        .await
        .expect("fresh trial admitted");
    assert_eq!(wrapper.circuit().state, CircuitState::Closed);
}

// =============================================================================
// Retry classification
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_failure_is_not_transient_it_is_never_retried() {
    for error in [
        SourceError::unauthorized("401"),
        SourceError::invalid_request("400"),
        SourceError::schema_mismatch("missing field"),
    ] {
        // Given: A generous retry budget
        let wrapper = wrapper(RetryPolicy::fixed(Duration::from_millis(10), 5), 10);
        let calls = AtomicUsize::new(0);

        // When: The operation fails with a permanent error
        let kind = error.kind();
        let returned = fail_with(&wrapper, &calls, error).await;

        // Then: Exactly one attempt
        assert_eq!(returned.kind(), kind);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{kind:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn when_a_payload_fails_to_parse_the_breaker_does_not_count_it() {
    // Given: One failure already on the streak
    let wrapper = wrapper(RetryPolicy::no_retry(), 2);
    let calls = AtomicUsize::new(0);
    fail_with(&wrapper, &calls, SourceError::unavailable("503")).await;

    // When: The next call reaches upstream but the payload is malformed
    fail_with(&wrapper, &calls, SourceError::schema_mismatch("bad json")).await;

    // Then: The source was reachable, so the streak resets
    assert_eq!(wrapper.circuit().state, CircuitState::Closed);
    assert_eq!(wrapper.circuit().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn when_rate_limited_the_retry_waits_longer_than_for_an_outage() {
    let policy = RetryPolicy {
        max_retries: 1,
        backoff: Backoff::Fixed {
            delay: Duration::from_millis(100),
        },
        rate_limit_multiplier: 4,
    };

    let mut waits = Vec::new();
    for error in [SourceError::unavailable("503"), SourceError::rate_limited("429")] {
        // Given: An operation that fails once, then succeeds
        let wrapper = wrapper(policy.clone(), 5);
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        // When: It is called through the wrapper
        wrapper
            .call(|| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                let error = error.clone();
                async move {
                    if attempt == 0 {
                        Err(error)
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .expect("second attempt succeeds");
        waits.push(started.elapsed());
    }

    // Then: 100ms after an outage, 400ms after a 429
    assert!(waits[0] >= Duration::from_millis(100) && waits[0] < Duration::from_millis(150));
    assert!(waits[1] >= Duration::from_millis(400) && waits[1] < Duration::from_millis(450));
}

#[test]
fn exponential_backoff_doubles_to_its_cap_and_jitter_stays_in_band() {
    // Given: 100ms base doubling to 1s
    let plain = Backoff::Exponential {
        base: Duration::from_millis(100),
        factor: 2.0,
        max: Duration::from_secs(1),
        jitter: false,
    };

    // Then: The schedule doubles and caps
    let schedule = (0..6).map(|attempt| plain.delay(attempt).as_millis()).collect::<Vec<_>>();
    assert_eq!(schedule, vec![100, 200, 400, 800, 1_000, 1_000]);

    // And: Jittered delays stay within half to full of the plain delay
    let jittered = Backoff::exponential(Duration::from_millis(100));
    for attempt in 0..6 {
        let ceiling = Duration::from_millis(100 * 2_u64.pow(attempt));
        let delay = jittered.delay(attempt);
        assert!(delay <= ceiling + Duration::from_millis(1), "attempt {attempt}: {delay:?}");
        assert!(delay + Duration::from_millis(1) >= ceiling / 2, "attempt {attempt}: {delay:?}");
    }
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_an_attempt_hangs_it_times_out_and_is_retried() {
    // Given: A 2s attempt deadline and one retry
    let wrapper = wrapper(RetryPolicy::fixed(Duration::from_millis(100), 1), 5);
    let calls = AtomicUsize::new(0);
    let started = Instant::now();

    // When: Every attempt hangs for a minute
    let error = wrapper
        .call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, SourceError>(())
            }
        })
        .await
        .expect_err("deadline");

    // Then: Two timed-out attempts, bounded by the deadline
    assert_eq!(error.kind(), SourceErrorKind::Timeout);
    assert!(error.retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}
