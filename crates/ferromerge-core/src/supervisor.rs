//! Scheduler and supervisor.
//!
//! Every collector and the materializer run as their own tokio task on their
//! own `interval`, so a slow source never delays another source's tick. A run
//! that overruns its interval completes, and the ticks it covered are skipped
//! rather than queued. Each collector run is spawned separately; a panic
//! surfaces as a `JoinError`, is counted, and is followed by a restart
//! backoff before the next tick.
//!
//! Per-collector state is owned by the collector's task and published through
//! a `watch` channel, which is where [`Supervisor::health`] and
//! [`Supervisor::snapshot`] read it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferromerge_warehouse::FeatureStore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::cache::StagingCache;
use crate::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::collector::Collector;
use crate::collectors::{build_collector, collect_once, CollectReport};
use crate::config::{EngineConfig, SupervisorSettings};
use crate::domain::{SourceType, UtcDateTime};
use crate::http_client::HttpClient;
use crate::materializer::{Materializer, MaterializerStats};
use crate::observability::{collector_span, supervisor_span};
use crate::resilience::{ResilienceConfig, ResilienceWrapper};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("no collectors registered")]
    NoCollectors,

    #[error("a collector for '{0}' is already registered")]
    DuplicateCollector(SourceType),

    #[error("collector interval for '{0}' must be greater than zero")]
    ZeroInterval(SourceType),

    #[error("supervisor is already running")]
    AlreadyRunning,

    #[error("supervisor has been stopped")]
    Stopped,
}

/// Health thresholds and restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub open_cycles_threshold: u32,
    pub restart_backoff: Duration,
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            open_cycles_threshold: settings.open_cycles_threshold,
            restart_backoff: settings.restart_backoff,
            sweep_interval: settings.sweep_interval,
        }
    }
}

/// Supervisory state of one collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorState {
    pub source: SourceType,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub last_run_at: Option<UtcDateTime>,
    pub last_success_at: Option<UtcDateTime>,
    pub consecutive_failures: u32,
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub panics: u64,
    /// Runs that took longer than the interval.
    pub overruns: u64,
    pub circuit: CircuitSnapshot,
    /// Consecutive cycles that ended with the circuit open.
    pub open_cycles: u32,
    pub last_error: Option<String>,
    pub last_report: Option<CollectReport>,
    /// Start of the last successful run; passed to the next fetch.
    pub cursor: Option<UtcDateTime>,
}

impl CollectorState {
    fn new(source: SourceType, interval: Duration, circuit: CircuitSnapshot) -> Self {
        Self {
            source,
            interval,
            last_run_at: None,
            last_success_at: None,
            consecutive_failures: 0,
            runs: 0,
            successes: 0,
            failures: 0,
            panics: 0,
            overruns: 0,
            circuit,
            open_cycles: 0,
            last_error: None,
            last_report: None,
            cursor: None,
        }
    }

    fn record_failure(&mut self, message: String) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(message);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorHealth {
    pub healthy: bool,
    #[serde(flatten)]
    pub state: CollectorState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterializerHealth {
    pub healthy: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub panics: u64,
    /// Milliseconds since the last successful cycle, if any.
    pub since_last_success_ms: Option<u64>,
    pub store_circuit: CircuitSnapshot,
    pub stats: MaterializerStats,
}

/// Health check result for the monitoring collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub ready: bool,
    pub checked_at: UtcDateTime,
    pub collectors: Vec<CollectorHealth>,
    pub materializer: MaterializerHealth,
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Idle,
    Running { started: Instant },
    Stopped,
}

struct CollectorTask {
    collector: Arc<dyn Collector>,
    wrapper: ResilienceWrapper,
    interval: Duration,
    state: watch::Sender<CollectorState>,
}

#[derive(Default)]
struct MaterializerProgress {
    last_success: Option<Instant>,
}

/// Owns the collector and materializer tasks.
pub struct Supervisor {
    cache: StagingCache,
    materializer: Arc<Materializer>,
    config: SupervisorConfig,
    pending: Mutex<Vec<CollectorTask>>,
    states: Mutex<BTreeMap<SourceType, watch::Receiver<CollectorState>>>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    progress: Arc<Mutex<MaterializerProgress>>,
    materializer_panics: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new(cache: StagingCache, materializer: Arc<Materializer>, config: SupervisorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache,
            materializer,
            config,
            pending: Mutex::new(Vec::new()),
            states: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            progress: Arc::new(Mutex::new(MaterializerProgress::default())),
            materializer_panics: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Supervisor with one collector per enabled source of `config`.
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn FeatureStore>,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, SupervisorError> {
        let cache = config.staging_cache();
        let materializer = Arc::new(Materializer::new(
            store,
            cache.clone(),
            config.materializer.materializer_config(),
        ));
        let supervisor = Self::new(cache, materializer, SupervisorConfig::from(&config.supervisor));

        for (source, settings) in config.enabled_sources() {
            let http = settings.http_source(source, Arc::clone(&client));
            let collector = build_collector(source, http, settings.entities.clone());
            supervisor.register_with(collector, settings.interval, settings.resilience())?;
        }
        if supervisor.collector_count() == 0 {
            return Err(SupervisorError::NoCollectors);
        }
        Ok(supervisor)
    }

    /// Register `collector` with default resilience settings.
    pub fn register(&self, collector: Arc<dyn Collector>, interval: Duration) -> Result<(), SupervisorError> {
        self.register_with(collector, interval, ResilienceConfig::default())
    }

    pub fn register_with(
        &self,
        collector: Arc<dyn Collector>,
        interval: Duration,
        resilience: ResilienceConfig,
    ) -> Result<(), SupervisorError> {
        match *self.lifecycle.lock().expect("lifecycle lock is not poisoned") {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(SupervisorError::AlreadyRunning),
            Lifecycle::Stopped => return Err(SupervisorError::Stopped),
        }

        let source = collector.source_type();
        if interval.is_zero() {
            return Err(SupervisorError::ZeroInterval(source));
        }
        let mut states = self.states.lock().expect("states lock is not poisoned");
        if states.contains_key(&source) {
            return Err(SupervisorError::DuplicateCollector(source));
        }

        let wrapper = ResilienceWrapper::new(source.as_str(), resilience);
        let (state, receiver) = watch::channel(CollectorState::new(source, interval, wrapper.circuit()));
        states.insert(source, receiver);
        self.pending
            .lock()
            .expect("pending lock is not poisoned")
            .push(CollectorTask {
                collector,
                wrapper,
                interval,
                state,
            });
        Ok(())
    }

    pub fn collector_count(&self) -> usize {
        self.states.lock().expect("states lock is not poisoned").len()
    }

    pub fn cache(&self) -> &StagingCache {
        &self.cache
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    /// Spawn every task and return. Must be called within a tokio runtime.
    pub fn run(&self) -> Result<(), SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock is not poisoned");
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(SupervisorError::AlreadyRunning),
            Lifecycle::Stopped => return Err(SupervisorError::Stopped),
        }
        let pending = std::mem::take(&mut *self.pending.lock().expect("pending lock is not poisoned"));
        if pending.is_empty() {
            return Err(SupervisorError::NoCollectors);
        }

        let span = supervisor_span(pending.len());
        let mut handles = Vec::with_capacity(pending.len() + 2);
        for task in pending {
            tracing::info!(
                parent: &span,
                source = %task.collector.source_type(),
                interval = %humantime::format_duration(task.interval),
                "collector scheduled"
            );
            handles.push(tokio::spawn(
                collector_loop(
                    task,
                    self.cache.clone(),
                    self.config.restart_backoff,
                    self.config.open_cycles_threshold,
                    self.shutdown.subscribe(),
                )
                .instrument(span.clone()),
            ));
        }
        handles.push(tokio::spawn(
            materializer_loop(
                Arc::clone(&self.materializer),
                Arc::clone(&self.progress),
                Arc::clone(&self.materializer_panics),
                self.config.restart_backoff,
                self.shutdown.subscribe(),
            )
            .instrument(span.clone()),
        ));
        handles.push(self.cache.spawn_sweeper(self.config.sweep_interval));

        *self.tasks.lock().expect("tasks lock is not poisoned") = handles;
        *lifecycle = Lifecycle::Running {
            started: Instant::now(),
        };
        tracing::info!(parent: &span, "supervisor started");
        Ok(())
    }

    /// Signal every task to stop and wait for them. In-flight runs are
    /// cancelled at their next suspension point.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock is not poisoned");
            if matches!(*lifecycle, Lifecycle::Stopped) {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock().expect("tasks lock is not poisoned"));
        let sweeper = handles.len().checked_sub(1);
        for (index, handle) in handles.into_iter().enumerate() {
            if Some(index) == sweeper {
                handle.abort();
            }
            if let Err(error) = handle.await {
                if error.is_panic() {
                    tracing::error!(%error, "supervised task panicked during shutdown");
                }
            }
        }
        tracing::info!("supervisor stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.lifecycle.lock().expect("lifecycle lock is not poisoned"),
            Lifecycle::Running { .. }
        )
    }

    /// Current state of every registered collector, ordered by source.
    pub fn snapshot(&self) -> Vec<CollectorState> {
        self.states
            .lock()
            .expect("states lock is not poisoned")
            .values()
            .map(|receiver| receiver.borrow().clone())
            .collect()
    }

    /// Healthy iff no circuit has stayed open for more than the configured
    /// number of cycles and the materializer succeeded within twice its
    /// interval.
    pub fn health(&self) -> HealthReport {
        let threshold = self.config.open_cycles_threshold;
        let collectors = self
            .snapshot()
            .into_iter()
            .map(|state| CollectorHealth {
                healthy: state.open_cycles <= threshold,
                state,
            })
            .collect::<Vec<_>>();

        let lifecycle = *self.lifecycle.lock().expect("lifecycle lock is not poisoned");
        let now = Instant::now();
        let interval = self.materializer.interval();
        let window = interval.saturating_mul(2);
        let last_success = self
            .progress
            .lock()
            .expect("progress lock is not poisoned")
            .last_success;
        let stats = self.materializer.stats();

        let materializer_healthy = match (lifecycle, last_success) {
            (Lifecycle::Running { .. }, Some(at)) => now.duration_since(at) <= window,
            (Lifecycle::Running { started }, None) => now.duration_since(started) <= window,
            _ => false,
        };
        let materializer = MaterializerHealth {
            healthy: materializer_healthy,
            interval,
            panics: self.materializer_panics.load(Ordering::Relaxed),
            since_last_success_ms: last_success.map(|at| duration_ms(now.duration_since(at))),
            store_circuit: self.materializer.store_wrapper().circuit(),
            stats,
        };

        let ready = matches!(lifecycle, Lifecycle::Running { .. }) && materializer.stats.runs > 0;
        HealthReport {
            healthy: materializer.healthy && collectors.iter().all(|collector| collector.healthy),
            ready,
            checked_at: UtcDateTime::now(),
            collectors,
            materializer,
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("collectors", &self.collector_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wait for the next tick; `false` once shutdown is signalled.
async fn next_tick(ticker: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = ticker.tick() => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

/// Sleep for `delay`; `false` if shutdown arrived first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn collector_loop(
    task: CollectorTask,
    cache: StagingCache,
    restart_backoff: Duration,
    open_cycles_threshold: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let source = task.collector.source_type();
    let mut ticker = tokio::time::interval(task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while next_tick(&mut ticker, &mut shutdown).await {
        let started = Instant::now();
        let started_at = UtcDateTime::now();
        let cursor = task.state.borrow().cursor;

        let collector = Arc::clone(&task.collector);
        let wrapper = task.wrapper.clone();
        let run_cache = cache.clone();
        let mut run = tokio::spawn(
            async move { collect_once(collector.as_ref(), &wrapper, &run_cache, cursor).await }
                .instrument(collector_span(source)),
        );

        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = shutdown.changed() => {
                run.abort();
                break;
            }
        };

        let elapsed = started.elapsed();
        let mut panicked = false;
        task.state.send_modify(|state| {
            state.runs += 1;
            state.last_run_at = Some(started_at);
            if elapsed > task.interval {
                state.overruns += 1;
                tracing::warn!(
                    %source,
                    elapsed_ms = duration_ms(elapsed),
                    interval_ms = duration_ms(task.interval),
                    "collector run overran its interval; missed ticks are skipped"
                );
            }

            match outcome {
                Ok(Ok(report)) => {
                    state.successes += 1;
                    state.consecutive_failures = 0;
                    state.last_success_at = Some(started_at);
                    state.cursor = Some(started_at);
                    state.last_error = None;
                    state.last_report = Some(report);
                    tracing::info!(
                        %source,
                        records = report.records,
                        dropped = report.dropped,
                        published = report.published,
                        "collection finished"
                    );
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        %source,
                        code = error.code(),
                        error = %error.message(),
                        consecutive_failures = state.consecutive_failures + 1,
                        "collection failed"
                    );
                    state.record_failure(format!("{}: {}", error.code(), error.message()));
                }
                Err(join_error) => {
                    panicked = join_error.is_panic();
                    if panicked {
                        state.panics += 1;
                    }
                    tracing::error!(%source, error = %join_error, "collection task crashed");
                    state.record_failure(format!("task crashed: {join_error}"));
                }
            }

            state.circuit = task.wrapper.circuit();
            if state.circuit.state == CircuitState::Closed {
                state.open_cycles = 0;
            } else {
                state.open_cycles += 1;
                if state.open_cycles == open_cycles_threshold + 1 {
                    tracing::error!(
                        %source,
                        open_cycles = state.open_cycles,
                        "circuit has stayed open past the health threshold"
                    );
                }
            }
        });

        if panicked && !pause(restart_backoff, &mut shutdown).await {
            break;
        }
    }
    tracing::debug!(%source, "collector task exiting");
}

async fn materializer_loop(
    materializer: Arc<Materializer>,
    progress: Arc<Mutex<MaterializerProgress>>,
    panics: Arc<AtomicU64>,
    restart_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(materializer.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while next_tick(&mut ticker, &mut shutdown).await {
        let engine = Arc::clone(&materializer);
        let mut run = tokio::spawn(async move { engine.run_cycle().await });
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = shutdown.changed() => {
                run.abort();
                break;
            }
        };

        match outcome {
            Ok(report) => {
                if report.succeeded() {
                    progress
                        .lock()
                        .expect("progress lock is not poisoned")
                        .last_success = Some(Instant::now());
                }
            }
            Err(error) => {
                if error.is_panic() {
                    panics.fetch_add(1, Ordering::Relaxed);
                }
                tracing::error!(%error, "materializer cycle crashed");
                if !pause(restart_backoff, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("materializer task exiting");
}
