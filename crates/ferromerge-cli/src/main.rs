mod cli;
mod commands;
mod error;
mod metadata;
mod output;

use clap::Parser;
use std::process::ExitCode;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(%error, "command failed");
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    ferromerge_core::init_logging(cli.log_format.into());

    if let Some(envelope) = commands::run(&cli).await? {
        output::render(&envelope, cli.format, cli.pretty)?;
    }
    Ok(ExitCode::SUCCESS)
}
