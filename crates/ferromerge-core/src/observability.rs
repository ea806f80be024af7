//! Logging setup and span constructors shared by the engine and the CLI.
//!
//! Log lines go to stderr so that command output on stdout stays parseable.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::domain::SourceType;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

impl LogFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}', expected json or pretty")),
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` controls levels (default `info`). Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Span wrapping one collection run.
#[must_use]
pub fn collector_span(source: SourceType) -> Span {
    tracing::info_span!("collector", source = source.as_str())
}

/// Span wrapping the merge of one source partition.
#[must_use]
pub fn materializer_span(source: SourceType, run_id: &str) -> Span {
    tracing::info_span!("materializer", source = source.as_str(), run_id = run_id)
}

/// Span wrapping the supervisor's lifetime.
#[must_use]
pub fn supervisor_span(collectors: usize) -> Span {
    tracing::info_span!("supervisor", collectors = collectors)
}
