//! Foreground collect-and-merge rounds, without the supervisor's schedule.

use std::io;
use std::sync::Arc;

use ferromerge_core::{
    build_collector, collect_once, CollectReport, Collector, EngineConfig, FeatureStore,
    HttpClient, MaterializeReport, Materializer, ReqwestHttpClient, ResilienceWrapper,
    SourceType, StagingCache, SupervisorError,
};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::cli::MaterializeArgs;
use crate::error::CliError;
use crate::output::stream_writer::{NdjsonStreamWriter, StreamEventType};

use super::CommandResult;

#[derive(Debug, Serialize)]
struct CollectionOutcome {
    source: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<CollectReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoundReport {
    collections: Vec<CollectionOutcome>,
    materialize: MaterializeReport,
}

impl RoundReport {
    fn warnings(&self) -> Vec<String> {
        let mut warnings = self
            .collections
            .iter()
            .filter_map(|outcome| {
                outcome
                    .error
                    .as_ref()
                    .map(|error| format!("{} collection failed: {error}", outcome.source))
            })
            .collect::<Vec<_>>();
        for source in &self.materialize.per_source {
            if !source.failed.is_empty() {
                warnings.push(format!(
                    "{} merge skipped {} key(s); they stay cached for the next round",
                    source.source,
                    source.failed.len()
                ));
            }
        }
        warnings
    }
}

/// Collectors, cache and materializer shared by every round of one invocation.
struct Rounds {
    collectors: Vec<(Arc<dyn Collector>, ResilienceWrapper)>,
    materializer: Materializer,
}

impl Rounds {
    fn new(args: &MaterializeArgs, config: &EngineConfig) -> Result<Self, CliError> {
        let sources = super::selected_sources(&args.sources, config)?;
        if sources.is_empty() {
            return Err(SupervisorError::NoCollectors.into());
        }

        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
        let mut collectors = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(settings) = config.source(source) else {
                continue;
            };
            let http = settings.http_source(source, Arc::clone(&client));
            collectors.push((
                build_collector(source, http, settings.entities.clone()),
                ResilienceWrapper::new(source.as_str(), settings.resilience()),
            ));
        }

        let store: Arc<dyn FeatureStore> = Arc::new(super::open_store(config)?);
        let cache: StagingCache = config.staging_cache();
        let materializer = Materializer::new(store, cache, config.materializer.materializer_config());
        Ok(Self {
            collectors,
            materializer,
        })
    }

    async fn execute(&self) -> RoundReport {
        let cache = self.materializer.cache();
        let mut collections = Vec::with_capacity(self.collectors.len());
        for (collector, wrapper) in &self.collectors {
            let source = collector.source_type();
            let outcome = match collect_once(collector.as_ref(), wrapper, cache, None).await {
                Ok(report) => CollectionOutcome {
                    source,
                    report: Some(report),
                    error: None,
                },
                Err(error) => CollectionOutcome {
                    source,
                    report: None,
                    error: Some(error.to_string()),
                },
            };
            collections.push(outcome);
        }

        RoundReport {
            collections,
            materialize: self.materializer.run_cycle().await,
        }
    }
}

pub async fn run_once(args: &MaterializeArgs, config: &EngineConfig) -> Result<CommandResult, CliError> {
    let rounds = Rounds::new(args, config)?;
    let report = rounds.execute().await;
    let warnings = report.warnings();
    Ok(CommandResult::ok(serde_json::to_value(&report)?).with_warnings(warnings))
}

/// Repeat rounds on the materializer interval until Ctrl-C, one NDJSON
/// report per round.
pub async fn run_rounds(args: &MaterializeArgs, config: &EngineConfig) -> Result<(), CliError> {
    let rounds = Rounds::new(args, config)?;
    let mut writer = NdjsonStreamWriter::new(io::stdout());
    writer.emit(
        StreamEventType::Start,
        &serde_json::json!({
            "interval": humantime::format_duration(rounds.materializer.interval()).to_string(),
        }),
    )?;

    let mut ticker = tokio::time::interval(rounds.materializer.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut completed = 0_u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = rounds.execute().await;
                completed += 1;
                writer.emit(StreamEventType::Report, &serde_json::to_value(&report)?)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    writer.emit(
        StreamEventType::End,
        &serde_json::to_value(rounds.materializer.stats())?,
    )?;
    tracing::info!(rounds = completed, "materialize rounds stopped");
    Ok(())
}
