mod cli;
mod config;
mod engine;
mod error;
mod host;
mod logging;
mod model;
mod orchestrator;
mod text_summary;

use clap::Parser;
use model::RunStatus;
use std::process::ExitCode;

/// Exit status used when the user aborted the run (128 + SIGINT).
const EXIT_ABORTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();
    if let Err(e) = logging::init_logging(args.verbose) {
        eprintln!("failed to initialise logging: {e:#}");
    }

    match cli::run(args).await {
        Ok(RunStatus::Finished) => ExitCode::SUCCESS,
        Ok(RunStatus::Aborted) => ExitCode::from(EXIT_ABORTED),
        Ok(RunStatus::Failed) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
