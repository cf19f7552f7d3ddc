//! DailyBrief CLI: collect news, derive images, enrich for learners.
//!
//! Runs the selected pipeline phases against the local work item store
//! and exits non-zero when the run was aborted by a fatal error.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
