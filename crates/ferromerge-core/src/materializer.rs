//! Materialization engine.
//!
//! Reads each source partition of the staging cache, keeps the latest-observed
//! record per feature key, and merges it into the feature store with one
//! column-group upsert. Ordering between records of the same source and key is
//! resolved by observation time, both here and by the store's conditional
//! update, so a late-arriving older record never overwrites a newer one.
//!
//! Store writes run on tokio's blocking pool and go through a dedicated
//! [`ResilienceWrapper`]. A key whose write still fails after retries is
//! skipped for the cycle; its cache entry stays put, so the next cycle retries
//! it. A cached record identical to the one last written for its key is not
//! written again: counters and the merge log only see real merges.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferromerge_warehouse::{
    FeatureKey, FeatureStore, MergeLogEntry, UpsertOutcome, WarehouseError,
};
use serde::Serialize;
use tracing::Instrument;

use crate::cache::StagingCache;
use crate::collector::SourceError;
use crate::domain::{SourceRecord, SourceType, UtcDateTime};
use crate::observability::materializer_span;
use crate::resilience::{ResilienceConfig, ResilienceWrapper};

/// Name of the resilience wrapper guarding store writes.
pub const STORE_DEPENDENCY: &str = "feature_store";

/// Materializer cadence and store-write resilience.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializerConfig {
    pub interval: Duration,
    pub store: ResilienceConfig,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            store: ResilienceConfig::default(),
        }
    }
}

/// Merge outcome for one source partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMergeReport {
    pub source: SourceType,
    /// Distinct feature keys found in the partition.
    pub keys: usize,
    /// Rows whose group now reflects the cached record.
    pub merged: usize,
    /// Writes rejected because the stored group was observed later.
    pub superseded: usize,
    /// Keys whose cached record was already written by an earlier cycle.
    pub unchanged: usize,
    /// Keys skipped this cycle after exhausting store retries.
    pub failed: Vec<String>,
}

impl SourceMergeReport {
    fn new(source: SourceType) -> Self {
        Self {
            source,
            keys: 0,
            merged: 0,
            superseded: 0,
            unchanged: 0,
            failed: Vec::new(),
        }
    }

    /// Keys this report attempted to write.
    pub fn attempted(&self) -> usize {
        self.keys - self.unchanged
    }

    /// The store accepted at least one write, or there was nothing to write.
    pub fn store_reachable(&self) -> bool {
        let attempted = self.attempted();
        attempted == 0 || self.failed.len() < attempted
    }
}

/// Outcome of a cycle over every source partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub run_id: String,
    pub started_at: UtcDateTime,
    pub finished_at: UtcDateTime,
    pub per_source: Vec<SourceMergeReport>,
}

impl MaterializeReport {
    pub fn rows_merged(&self) -> usize {
        self.per_source.iter().map(|report| report.merged).sum()
    }

    pub fn failed_keys(&self) -> usize {
        self.per_source.iter().map(|report| report.failed.len()).sum()
    }

    pub fn succeeded(&self) -> bool {
        self.per_source.iter().all(SourceMergeReport::store_reachable)
    }
}

/// Counters exposed to the monitoring boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializerStats {
    pub runs: u64,
    pub failed_runs: u64,
    pub last_run_at: Option<UtcDateTime>,
    pub last_success_at: Option<UtcDateTime>,
    pub last_run_duration_ms: u64,
    pub rows_merged_total: u64,
    pub superseded_total: u64,
    pub failed_keys_total: u64,
}

/// Consolidating writer from the staging cache to the feature store.
pub struct Materializer {
    store: Arc<dyn FeatureStore>,
    cache: StagingCache,
    wrapper: ResilienceWrapper,
    interval: Duration,
    stats: Mutex<MaterializerStats>,
    written: Mutex<HashMap<(SourceType, FeatureKey), SourceRecord>>,
}

impl Materializer {
    pub fn new(store: Arc<dyn FeatureStore>, cache: StagingCache, config: MaterializerConfig) -> Self {
        Self {
            store,
            cache,
            wrapper: ResilienceWrapper::new(STORE_DEPENDENCY, config.store),
            interval: config.interval,
            stats: Mutex::new(MaterializerStats::default()),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cache(&self) -> &StagingCache {
        &self.cache
    }

    pub fn store_wrapper(&self) -> &ResilienceWrapper {
        &self.wrapper
    }

    pub fn stats(&self) -> MaterializerStats {
        self.stats
            .lock()
            .expect("materializer stats lock is not poisoned")
            .clone()
    }

    /// Merge one source partition; returns the per-source report.
    pub async fn materialize(&self, source: SourceType) -> SourceMergeReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.merge_source(source, &run_id)
            .instrument(materializer_span(source, &run_id))
            .await
    }

    /// Merge every source partition once and update the stats.
    pub async fn run_cycle(&self) -> MaterializeReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = UtcDateTime::now();
        let clock = tokio::time::Instant::now();

        let mut per_source = Vec::with_capacity(SourceType::ALL.len());
        for source in SourceType::ALL {
            let report = self
                .merge_source(source, &run_id)
                .instrument(materializer_span(source, &run_id))
                .await;
            per_source.push(report);
        }

        let report = MaterializeReport {
            run_id,
            started_at,
            finished_at: UtcDateTime::now(),
            per_source,
        };
        self.record_cycle(&report, clock.elapsed());
        tracing::info!(
            run_id = %report.run_id,
            rows_merged = report.rows_merged(),
            failed_keys = report.failed_keys(),
            "materializer cycle finished"
        );
        report
    }

    async fn merge_source(&self, source: SourceType, run_id: &str) -> SourceMergeReport {
        let mut report = SourceMergeReport::new(source);
        let latest = latest_per_key(self.cache.get_all(source).await);
        report.keys = latest.len();
        let pending = self.unwritten(source, latest);
        report.unchanged = report.keys - pending.len();

        for (key, record) in pending {
            let outcome = self.write_key(&key, &record, run_id).await;
            if outcome.is_ok() {
                self.mark_written(source, key.clone(), record);
            }
            match outcome {
                Ok(UpsertOutcome::Applied) => report.merged += 1,
                Ok(UpsertOutcome::Superseded) => report.superseded += 1,
                Err(error) => {
                    tracing::warn!(
                        %source,
                        key = %key,
                        code = error.code(),
                        error = %error.message(),
                        "merge failed; key skipped for this cycle"
                    );
                    report.failed.push(key.to_string());
                }
            }
        }

        if report.keys > 0 {
            tracing::debug!(
                %source,
                keys = report.keys,
                merged = report.merged,
                superseded = report.superseded,
                unchanged = report.unchanged,
                failed = report.failed.len(),
                "source partition merged"
            );
        }
        report
    }

    /// Drop records already written for their key, and forget written keys
    /// that have left the partition.
    fn unwritten(
        &self,
        source: SourceType,
        latest: BTreeMap<FeatureKey, SourceRecord>,
    ) -> Vec<(FeatureKey, SourceRecord)> {
        let mut written = self
            .written
            .lock()
            .expect("materializer written-set lock is not poisoned");
        written.retain(|(owner, key), _| *owner != source || latest.contains_key(key));
        latest
            .into_iter()
            .filter(|(key, record)| written.get(&(source, key.clone())) != Some(record))
            .collect()
    }

    fn mark_written(&self, source: SourceType, key: FeatureKey, record: SourceRecord) {
        self.written
            .lock()
            .expect("materializer written-set lock is not poisoned")
            .insert((source, key), record);
    }

    async fn write_key(
        &self,
        key: &FeatureKey,
        record: &SourceRecord,
        run_id: &str,
    ) -> Result<UpsertOutcome, SourceError> {
        let write = record.to_group_write();
        self.wrapper
            .call(|| {
                let store = Arc::clone(&self.store);
                let key = key.clone();
                let write = write.clone();
                let run_id = run_id.to_owned();
                async move {
                    tokio::task::spawn_blocking(move || -> Result<UpsertOutcome, SourceError> {
                        let outcome = store
                            .upsert_partial(&key, &write)
                            .map_err(store_error)?;
                        let entry = MergeLogEntry {
                            run_id,
                            source: write.source,
                            key,
                            status: match outcome {
                                UpsertOutcome::Applied => "applied",
                                UpsertOutcome::Superseded => "superseded",
                            },
                            observed_at_ms: write.observed_at_ms,
                        };
                        if let Err(error) = store.record_merge(&entry) {
                            tracing::warn!(key = %entry.key, %error, "merge log write failed");
                        }
                        Ok(outcome)
                    })
                    .await
                    .unwrap_or_else(|error| {
                        Err(SourceError::internal(format!("store write task failed: {error}")))
                    })
                }
            })
            .await
    }

    fn record_cycle(&self, report: &MaterializeReport, elapsed: Duration) {
        let mut stats = self
            .stats
            .lock()
            .expect("materializer stats lock is not poisoned");
        stats.runs += 1;
        stats.last_run_at = Some(report.finished_at);
        stats.last_run_duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        stats.rows_merged_total += report.rows_merged() as u64;
        stats.superseded_total += report
            .per_source
            .iter()
            .map(|source| source.superseded as u64)
            .sum::<u64>();
        stats.failed_keys_total += report.failed_keys() as u64;
        if report.succeeded() {
            stats.last_success_at = Some(report.finished_at);
        } else {
            stats.failed_runs += 1;
        }
    }
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("interval", &self.interval)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Keep the latest-observed record per feature key. Ties go to the record
/// emitted last.
fn latest_per_key(records: Vec<SourceRecord>) -> BTreeMap<FeatureKey, SourceRecord> {
    let mut latest: BTreeMap<FeatureKey, SourceRecord> = BTreeMap::new();
    for record in records {
        let Ok(key) = record.feature_key() else {
            tracing::warn!(entity = %record.entity(), date = record.date(), "record has no valid feature key");
            continue;
        };
        match latest.get(&key) {
            Some(current) if current.observed_at() > record.observed_at() => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    latest
}

/// Connectivity and engine errors are transient. A rejected write is a data
/// problem and must not trip the store breaker.
fn store_error(error: WarehouseError) -> SourceError {
    match &error {
        WarehouseError::DuckDb(_) | WarehouseError::Io(_) => {
            SourceError::store_write_failure(error.to_string())
        }
        WarehouseError::InvalidData(_)
        | WarehouseError::UnknownSource(_)
        | WarehouseError::ForeignColumn { .. } => SourceError::schema_mismatch(error.to_string()),
    }
}
