// Shared fixtures for the behaviour suites
pub use ferromerge_core::{
    CircuitBreakerConfig, EntityKey, FeatureKey, ResilienceConfig, ResilienceWrapper, RetryPolicy,
};
pub use std::sync::Arc;

use std::time::Duration;

/// The single entity every scenario collects.
pub fn entities() -> Vec<EntityKey> {
    vec![EntityKey::parse("BTC").expect("entity")]
}

/// Row key of the BTC bar dated 2025-10-20.
pub fn btc_key() -> FeatureKey {
    FeatureKey::new("BTC", "2025-10-20").expect("key")
}

/// No retries, a breaker opening after `threshold` failures and a generous
/// attempt deadline.
pub fn fail_fast_config(threshold: u32, cooldown: Duration) -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryPolicy::no_retry(),
        breaker: CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
            max_cooldown: Duration::from_secs(600),
        },
        attempt_timeout: Duration::from_secs(5),
    }
}

pub fn fail_fast(threshold: u32) -> ResilienceWrapper {
    ResilienceWrapper::new("upstream", fail_fast_config(threshold, Duration::from_secs(30)))
}
