use std::io;
use std::sync::Arc;

use ferromerge_core::{EngineConfig, FeatureStore, HttpClient, ReqwestHttpClient, Supervisor};
use serde_json::json;
use tokio::time::MissedTickBehavior;

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::output::stream_writer::{NdjsonStreamWriter, StreamEventType};

/// Start the supervisor and stream health reports until Ctrl-C or `--run-for`.
pub async fn run(args: &RunArgs, config: &EngineConfig) -> Result<(), CliError> {
    if args.status_every.is_zero() {
        return Err(CliError::Command(String::from(
            "--status-every must be greater than zero",
        )));
    }

    let store: Arc<dyn FeatureStore> = Arc::new(super::open_store(config)?);
    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    let supervisor = Supervisor::from_config(config, store, client)?;
    supervisor.run()?;

    let mut writer = NdjsonStreamWriter::new(io::stdout());
    let sources = supervisor
        .snapshot()
        .iter()
        .map(|state| state.source.as_str())
        .collect::<Vec<_>>();
    writer.emit(
        StreamEventType::Start,
        &json!({ "collectors": sources, "status_every": humantime::format_duration(args.status_every).to_string() }),
    )?;

    let mut status = tokio::time::interval(args.status_every);
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);
    status.tick().await;

    let deadline = async {
        match args.run_for {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = status.tick() => {
                let health = serde_json::to_value(supervisor.health())?;
                writer.emit(StreamEventType::Status, &health)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("interrupt received; stopping");
                break;
            }
            () = &mut deadline => {
                tracing::info!("run duration elapsed; stopping");
                break;
            }
        }
    }

    supervisor.stop().await;
    let health = serde_json::to_value(supervisor.health())?;
    writer.emit(StreamEventType::End, &health)?;
    Ok(())
}
