//! Engine configuration.
//!
//! Loaded from YAML. Every section is optional; omitted values fall back to
//! the built-in defaults, and per-source overrides only replace the fields
//! they name. Durations are human strings such as `"250ms"`, `"30s"` or `"6h"`.
//! `retryMax` counts retries after the first attempt, so a call makes at most
//! `retryMax + 1` attempts.
//!
//! ```yaml
//! materializer:
//!   interval: 1m
//! supervisor:
//!   open_cycles_threshold: 3
//! sources:
//!   price:
//!     interval: 1m
//!     baseUrl: https://bars.internal
//!     apiKeyEnv: PRICE_API_KEY
//!   macro:
//!     enabled: false
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferromerge_warehouse::WarehouseConfig;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::cache::{PartitionPolicy, StagingCache};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::collectors::HttpSource;
use crate::domain::{EntityKey, SourceType};
use crate::http_client::{HttpAuth, HttpClient};
use crate::materializer::MaterializerConfig;
use crate::resilience::ResilienceConfig;
use crate::retry::RetryPolicy;
use crate::throttling::RequestBudget;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "FERROMERGE_CONFIG";

const DEFAULT_ENTITIES: [&str; 2] = ["BTC", "ETH"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config value '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub materializer: MaterializerSettings,
    pub supervisor: SupervisorSettings,
    pub warehouse: WarehouseSettings,
    #[serde(deserialize_with = "deserialize_sources")]
    pub sources: BTreeMap<SourceType, SourceConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            materializer: MaterializerSettings::default(),
            supervisor: SupervisorSettings::default(),
            warehouse: WarehouseSettings::default(),
            sources: SourceType::ALL
                .into_iter()
                .map(|source| (source, SourceConfig::defaults_for(source)))
                .collect(),
        }
    }
}

/// Materializer cadence and feature-store resilience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct MaterializerSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Retries after the first attempt; `0` disables retrying.
    pub retry_max: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for MaterializerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            retry_max: 3,
            backoff_base: Duration::from_millis(500),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl MaterializerSettings {
    pub fn materializer_config(&self) -> MaterializerConfig {
        MaterializerConfig {
            interval: self.interval,
            store: ResilienceConfig {
                retry: RetryPolicy::exponential(self.retry_max, self.backoff_base),
                breaker: CircuitBreakerConfig {
                    failure_threshold: self.failure_threshold,
                    cooldown: self.cooldown,
                    max_cooldown: self.max_cooldown,
                },
                attempt_timeout: self.request_timeout,
            },
        }
    }
}

/// Health thresholds and task restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    /// Consecutive cycles a circuit may stay open before the engine reports
    /// unhealthy.
    pub open_cycles_threshold: u32,
    /// Missed cycles after which a feature group is reported stale.
    pub stale_after_cycles: u32,
    /// Pause before a collector runs again after its run panicked.
    #[serde(with = "humantime_serde")]
    pub restart_backoff: Duration,
    /// Period of the staging-cache expiry sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            open_cycles_threshold: 3,
            stale_after_cycles: 3,
            restart_backoff: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseSettings {
    /// Database file; defaults to `$FERROMERGE_HOME/store/features.duckdb`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<usize>,
}

impl WarehouseSettings {
    pub fn warehouse_config(&self) -> WarehouseConfig {
        let mut config = WarehouseConfig::default();
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(max_pool_size) = self.max_pool_size {
            config.max_pool_size = max_pool_size;
        }
        config
    }
}

/// Settings of one collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SourceConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Retries after the first attempt; `0` disables retrying.
    pub retry_max: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
    #[serde(rename = "cacheTTL", with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub base_url: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never appears in configuration or logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    pub entities: Vec<EntityKey>,
}

impl SourceConfig {
    /// Built-in settings for `source`.
    pub fn defaults_for(source: SourceType) -> Self {
        let (minutes, port) = match source {
            SourceType::Price => (5, 8701),
            SourceType::Sentiment => (15, 8702),
            SourceType::Technical => (60, 8703),
            SourceType::Macro => (6 * 60, 8704),
            SourceType::Onchain => (6 * 60, 8705),
            SourceType::Derivatives => (60, 8706),
        };
        let interval = Duration::from_secs(minutes * 60);
        Self {
            enabled: true,
            interval,
            retry_max: 3,
            backoff_base: Duration::from_millis(500),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(10 * 60),
            cache_ttl: interval.saturating_mul(2),
            cache_max_entries: 1024,
            base_url: format!("http://127.0.0.1:{port}"),
            api_key_env: None,
            request_timeout: Duration::from_secs(10),
            rate_limit_per_minute: None,
            entities: DEFAULT_ENTITIES
                .iter()
                .filter_map(|entity| EntityKey::parse(entity).ok())
                .collect(),
        }
    }

    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy::exponential(self.retry_max, self.backoff_base),
            breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                cooldown: self.cooldown,
                max_cooldown: self.max_cooldown,
            },
            attempt_timeout: self.request_timeout,
        }
    }

    pub const fn partition_policy(&self) -> PartitionPolicy {
        PartitionPolicy {
            ttl: self.cache_ttl,
            max_entries: self.cache_max_entries,
        }
    }

    /// Bearer auth from the variable named by `apiKeyEnv`, looked up through
    /// `lookup`. A named but unset variable leaves the source unauthenticated.
    pub fn auth_with(&self, source: SourceType, lookup: impl Fn(&str) -> Option<String>) -> HttpAuth {
        let Some(name) = self.api_key_env.as_deref() else {
            return HttpAuth::None;
        };
        match lookup(name).filter(|key| !key.trim().is_empty()) {
            Some(key) => HttpAuth::BearerToken(key.trim().to_owned()),
            None => {
                tracing::warn!(%source, variable = name, "api key variable is not set; requests go out unauthenticated");
                HttpAuth::None
            }
        }
    }

    /// HTTP access for the collector of `source`.
    pub fn http_source(&self, source: SourceType, client: Arc<dyn HttpClient>) -> HttpSource {
        let auth = self.auth_with(source, |name| env::var(name).ok());
        let http = HttpSource::new(source, client, self.base_url.clone())
            .with_auth(auth)
            .with_timeout(self.request_timeout);
        match self.rate_limit_per_minute {
            Some(limit) => http.with_budget(RequestBudget::per_minute(limit)),
            None => http,
        }
    }

    fn validate(&self, source: SourceType) -> Result<(), ConfigError> {
        let field = |name: &str| format!("sources.{source}.{name}");
        if self.interval.is_zero() {
            return Err(ConfigError::invalid(field("interval"), "must be greater than zero"));
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::invalid(field("cacheTTL"), "must be greater than zero"));
        }
        if self.cache_max_entries == 0 {
            return Err(ConfigError::invalid(field("cacheMaxEntries"), "must be greater than zero"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(field("failureThreshold"), "must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid(field("requestTimeout"), "must be greater than zero"));
        }
        if self.cooldown > self.max_cooldown {
            return Err(ConfigError::invalid(field("cooldown"), "must not exceed maxCooldown"));
        }
        if self.rate_limit_per_minute == Some(0) {
            return Err(ConfigError::invalid(field("rateLimitPerMinute"), "must be greater than zero"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(field("baseUrl"), "must be an http(s) URL"));
        }
        if self.entities.is_empty() {
            return Err(ConfigError::invalid(field("entities"), "must name at least one entity"));
        }
        Ok(())
    }
}

/// Partial per-source settings as written in a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct SourceOverrides {
    enabled: Option<bool>,
    #[serde(with = "humantime_serde")]
    interval: Option<Duration>,
    retry_max: Option<u32>,
    #[serde(with = "humantime_serde")]
    backoff_base: Option<Duration>,
    failure_threshold: Option<u32>,
    #[serde(with = "humantime_serde")]
    cooldown: Option<Duration>,
    #[serde(with = "humantime_serde")]
    max_cooldown: Option<Duration>,
    #[serde(rename = "cacheTTL", with = "humantime_serde")]
    cache_ttl: Option<Duration>,
    cache_max_entries: Option<usize>,
    base_url: Option<String>,
    api_key_env: Option<String>,
    #[serde(with = "humantime_serde")]
    request_timeout: Option<Duration>,
    rate_limit_per_minute: Option<u32>,
    entities: Option<Vec<EntityKey>>,
}

impl SourceOverrides {
    fn apply(self, config: &mut SourceConfig) {
        if let Some(interval) = self.interval {
            config.interval = interval;
            if self.cache_ttl.is_none() {
                config.cache_ttl = interval.saturating_mul(2);
            }
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(retry_max) = self.retry_max {
            config.retry_max = retry_max;
        }
        if let Some(backoff_base) = self.backoff_base {
            config.backoff_base = backoff_base;
        }
        if let Some(failure_threshold) = self.failure_threshold {
            config.failure_threshold = failure_threshold;
        }
        if let Some(cooldown) = self.cooldown {
            config.cooldown = cooldown;
        }
        if let Some(max_cooldown) = self.max_cooldown {
            config.max_cooldown = max_cooldown;
        }
        if let Some(cache_ttl) = self.cache_ttl {
            config.cache_ttl = cache_ttl;
        }
        if let Some(cache_max_entries) = self.cache_max_entries {
            config.cache_max_entries = cache_max_entries;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = base_url.trim_end_matches('/').to_owned();
        }
        if self.api_key_env.is_some() {
            config.api_key_env = self.api_key_env;
        }
        if let Some(request_timeout) = self.request_timeout {
            config.request_timeout = request_timeout;
        }
        if self.rate_limit_per_minute.is_some() {
            config.rate_limit_per_minute = self.rate_limit_per_minute;
        }
        if let Some(entities) = self.entities {
            config.entities = entities;
        }
    }
}

/// Sources not named in the file keep their defaults.
fn deserialize_sources<'de, D>(deserializer: D) -> Result<BTreeMap<SourceType, SourceConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<SourceType, SourceOverrides>::deserialize(deserializer)?;
    let mut sources = EngineConfig::default().sources;
    for (source, overrides) in overrides {
        let config = sources
            .entry(source)
            .or_insert_with(|| SourceConfig::defaults_for(source));
        overrides.apply(config);
    }
    Ok(sources)
}

impl EngineConfig {
    /// Read, parse and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `explicit` path, else `FERROMERGE_CONFIG`, else built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
            return Self::load(Path::new(&path));
        }
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let materializer = &self.materializer;
        if materializer.interval.is_zero() {
            return Err(ConfigError::invalid("materializer.interval", "must be greater than zero"));
        }
        if materializer.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "materializer.failureThreshold",
                "must be greater than zero",
            ));
        }
        if materializer.request_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "materializer.requestTimeout",
                "must be greater than zero",
            ));
        }
        if self.supervisor.open_cycles_threshold == 0 {
            return Err(ConfigError::invalid(
                "supervisor.open_cycles_threshold",
                "must be greater than zero",
            ));
        }
        if self.supervisor.stale_after_cycles == 0 {
            return Err(ConfigError::invalid(
                "supervisor.stale_after_cycles",
                "must be greater than zero",
            ));
        }
        if self.supervisor.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "supervisor.sweep_interval",
                "must be greater than zero",
            ));
        }
        if self.warehouse.max_pool_size == Some(0) {
            return Err(ConfigError::invalid(
                "warehouse.max_pool_size",
                "must be greater than zero",
            ));
        }
        for (source, config) in self.enabled_sources() {
            config.validate(source)?;
        }

        if let Some((source, fastest)) = self
            .enabled_sources()
            .map(|(source, config)| (source, config.interval))
            .min_by_key(|(_, interval)| *interval)
        {
            if materializer.interval > fastest {
                return Err(ConfigError::invalid(
                    "materializer.interval",
                    format!(
                        "{} is longer than the fastest collector interval ({source}: {})",
                        humantime::format_duration(materializer.interval),
                        humantime::format_duration(fastest)
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = (SourceType, &SourceConfig)> + '_ {
        self.sources
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(source, config)| (*source, config))
    }

    pub fn source(&self, source: SourceType) -> Option<&SourceConfig> {
        self.sources.get(&source)
    }

    /// Staging cache carrying each source's partition policy.
    pub fn staging_cache(&self) -> StagingCache {
        StagingCache::with_policies(
            PartitionPolicy::default(),
            self.sources
                .iter()
                .map(|(source, config)| (*source, config.partition_policy())),
        )
    }

    /// Age after which a source's feature group counts as stale.
    pub fn staleness_window(&self, source: SourceType) -> Duration {
        let interval = self
            .sources
            .get(&source)
            .map_or_else(|| SourceConfig::defaults_for(source).interval, |config| config.interval);
        interval.saturating_mul(self.supervisor.stale_after_cycles)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<effective>"),
            source,
        })
    }
}
