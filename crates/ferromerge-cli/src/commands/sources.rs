use ferromerge_core::EngineConfig;
use serde::Serialize;

use crate::cli::SourcesArgs;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourceSummary {
    source: &'static str,
    enabled: bool,
    interval: String,
    cache_ttl: String,
    cache_max_entries: usize,
    retry_max: u32,
    failure_threshold: u32,
    base_url: String,
    authenticated: bool,
    entities: Vec<String>,
    observed_at_column: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    columns: Option<&'static [&'static str]>,
}

pub fn run(args: &SourcesArgs, config: &EngineConfig) -> CommandResult {
    let sources = config
        .sources
        .iter()
        .map(|(source, settings)| {
            let group = source.group();
            SourceSummary {
                source: source.as_str(),
                enabled: settings.enabled,
                interval: humantime::format_duration(settings.interval).to_string(),
                cache_ttl: humantime::format_duration(settings.cache_ttl).to_string(),
                cache_max_entries: settings.cache_max_entries,
                retry_max: settings.retry_max,
                failure_threshold: settings.failure_threshold,
                base_url: settings.base_url.clone(),
                authenticated: settings.api_key_env.is_some(),
                entities: settings.entities.iter().map(ToString::to_string).collect(),
                observed_at_column: group.observed_at_column,
                columns: args.verbose.then_some(group.columns),
            }
        })
        .collect::<Vec<_>>();

    let disabled = sources.iter().filter(|summary| !summary.enabled).count();
    let data = serde_json::json!({
        "materializer_interval": humantime::format_duration(config.materializer.interval).to_string(),
        "sources": sources,
    });
    let result = CommandResult::ok(data);
    if disabled == config.sources.len() {
        result.with_warning("every source is disabled; `run` will refuse to start")
    } else {
        result
    }
}
