mod config;
mod materialize;
mod run;
mod show;
mod sources;

use std::str::FromStr;
use std::time::Instant;

use ferromerge_core::{EngineConfig, SourceType, Warehouse};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::metadata::Metadata;
use crate::output::Envelope;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Run the selected command. `None` means the command wrote its own output.
pub async fn run(cli: &Cli) -> Result<Option<Envelope>, CliError> {
    let config = EngineConfig::resolve(cli.config.as_deref())?;
    let started = Instant::now();

    let (command, result) = match &cli.command {
        Command::Run(args) => {
            run::run(args, &config).await?;
            return Ok(None);
        }
        Command::Materialize(args) if !args.once => {
            materialize::run_rounds(args, &config).await?;
            return Ok(None);
        }
        Command::Materialize(args) => ("materialize", materialize::run_once(args, &config).await?),
        Command::Show(args) => ("show", show::run(args, &config)?),
        Command::Sources(args) => ("sources", sources::run(args, &config)),
        Command::Config => {
            config::run(&config)?;
            return Ok(None);
        }
    };

    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let mut meta = Metadata::new(command, latency_ms);
    for warning in result.warnings {
        meta.push_warning(warning);
    }
    Ok(Some(Envelope {
        meta,
        data: result.data,
    }))
}

fn open_store(config: &EngineConfig) -> Result<Warehouse, CliError> {
    let warehouse_config = config.warehouse.warehouse_config();
    tracing::debug!(path = %warehouse_config.db_path.display(), "opening feature store");
    Ok(Warehouse::open(warehouse_config)?)
}

/// Named sources, or every enabled source when `names` is empty.
fn selected_sources(names: &[String], config: &EngineConfig) -> Result<Vec<SourceType>, CliError> {
    if names.is_empty() {
        return Ok(config.enabled_sources().map(|(source, _)| source).collect());
    }

    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let source = SourceType::from_str(name)
            .map_err(|_| CliError::Command(format!("unknown source '{name}'")))?;
        let enabled = config.source(source).is_some_and(|settings| settings.enabled);
        if !enabled {
            return Err(CliError::Command(format!("source '{source}' is disabled")));
        }
        if !selected.contains(&source) {
            selected.push(source);
        }
    }
    Ok(selected)
}
