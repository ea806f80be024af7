//! CLI argument definitions for ferromerge.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Start the supervisor with every enabled collector |
//! | `materialize` | Collect each source and merge into the feature store |
//! | `show` | Print one feature row with per-group freshness |
//! | `sources` | List configured sources and their column groups |
//! | `config` | Print the effective configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `$FERROMERGE_CONFIG` | YAML configuration file |
//! | `--log-format` | `pretty` | Log output format (json, pretty) |
//! | `--format` | `json` | Output format (json, yaml) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! ferromerge run --config engine.yaml --status-every 30s
//! ferromerge materialize --once --pretty
//! ferromerge show BTC 2025-10-20
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ferromerge_core::LogFormat;

/// Multi-source incremental feature materialization.
#[derive(Debug, Parser)]
#[command(
    name = "ferromerge",
    author,
    version,
    about = "Multi-source incremental feature materialization",
    long_about = "ferromerge runs independently scheduled collectors for price, sentiment, \
technical, macro, on-chain and derivatives data and merges their output into one \
wide DuckDB feature row per entity and date.\n\
\n\
Use 'ferromerge <command> --help' for command-specific help."
)]
pub struct Cli {
    /// YAML configuration file. Falls back to $FERROMERGE_CONFIG, then defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format, written to stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Output format for command results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => Self::Json,
            LogFormatArg::Pretty => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor and run until Ctrl-C.
    ///
    /// Prints one health report per line (NDJSON) every --status-every.
    ///
    /// # Examples
    ///
    ///   ferromerge run
    ///   ferromerge run --status-every 30s --log-format json
    Run(RunArgs),

    /// Collect every enabled source once and merge the results.
    ///
    /// # Examples
    ///
    ///   ferromerge materialize --once
    ///   ferromerge materialize --source price --source sentiment --once
    Materialize(MaterializeArgs),

    /// Print one feature row.
    ///
    /// # Examples
    ///
    ///   ferromerge show BTC 2025-10-20
    Show(ShowArgs),

    /// List configured sources, cadences and column groups.
    Sources(SourcesArgs),

    /// Print the effective configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Interval between health reports on stdout.
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub status_every: Duration,

    /// Stop after this long instead of waiting for Ctrl-C.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_for: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct MaterializeArgs {
    /// Run a single collect-and-merge round and exit. Without it, rounds
    /// repeat on the materializer interval until Ctrl-C.
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Restrict collection to these sources (default: every enabled source).
    #[arg(long = "source", value_name = "SOURCE")]
    pub sources: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Entity key, e.g. BTC.
    pub entity: String,

    /// Row date, YYYY-MM-DD.
    pub date: String,
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Include the column catalog of each group.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}
