//! # Ferromerge Core
//!
//! Multi-source incremental feature materialization.
//!
//! ## Overview
//!
//! Independently scheduled collectors fetch price, sentiment, technical,
//! macro, on-chain and derivatives data, normalize it into per-source column
//! groups and publish it to a staging cache. The materializer merges the
//! cached groups into one wide feature row per `(entity, date)` without
//! touching columns owned by other sources.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Type-partitioned staging cache with TTL and insertion-order eviction |
//! | [`circuit_breaker`] | Closed/open/half-open breaker with cooldown doubling |
//! | [`collector`] | Collector trait, raw payloads and the source error taxonomy |
//! | [`collectors`] | The six concrete collectors and the single-run driver |
//! | [`config`] | YAML engine configuration |
//! | [`domain`] | Entity keys, timestamps and source records |
//! | [`error`] | Core error types |
//! | [`http_client`] | HTTP client abstraction |
//! | [`materializer`] | Staging cache to feature store merge |
//! | [`observability`] | Logging setup and spans |
//! | [`resilience`] | Retry, breaker and timeout around outbound calls |
//! | [`retry`] | Backoff and retry policy |
//! | [`supervisor`] | Task scheduling, restart and health |
//! | [`throttling`] | Per-source request budgets |
//!
//! ## Data flow
//!
//! ```text
//! upstream API ──▶ Collector ──(ResilienceWrapper)──▶ StagingCache
//!                                                        │
//!                                                        ▼
//!                         FeatureStore ◀── Materializer (partial upsert)
//! ```
//!
//! ## Error Handling
//!
//! Collector and store failures carry a [`SourceErrorKind`]; only transient
//! kinds are retried.
//!
//! ```rust
//! use ferromerge_core::{SourceError, SourceErrorKind};
//!
//! fn describe(error: &SourceError) -> &'static str {
//!     match error.kind() {
//!         SourceErrorKind::CircuitOpen => "failing fast",
//!         kind if kind.is_transient() => "will retry",
//!         _ => "dropped",
//!     }
//! }
//!
//! assert_eq!(describe(&SourceError::timeout("slow")), "will retry");
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod collector;
pub mod collectors;
pub mod config;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod materializer;
pub mod observability;
pub mod resilience;
pub mod retry;
pub mod supervisor;
pub mod throttling;

pub use cache::{PartitionPolicy, PartitionStats, PutOutcome, StagingCache};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use collector::{Collector, Normalized, RawPayload, SourceError, SourceErrorKind};
pub use collectors::{build_collector, collect_once, CollectReport, HttpSource};
pub use config::{ConfigError, EngineConfig, SourceConfig};
pub use domain::{CacheKey, EntityKey, SourceRecord, SourceType, UtcDateTime};
pub use error::{CoreError, ValidationError};
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};
pub use materializer::{
    MaterializeReport, Materializer, MaterializerConfig, MaterializerStats, SourceMergeReport,
};
pub use observability::{init_logging, LogFormat};
pub use resilience::{ResilienceConfig, ResilienceWrapper};
pub use retry::{Backoff, RetryPolicy};
pub use supervisor::{CollectorState, HealthReport, Supervisor, SupervisorConfig, SupervisorError};
pub use throttling::RequestBudget;

pub use ferromerge_warehouse::{
    FeatureKey, FeatureRow, FeatureStore, GroupFreshness, GroupWrite, MemoryFeatureStore,
    UpsertOutcome, Warehouse, WarehouseConfig, WarehouseError,
};
