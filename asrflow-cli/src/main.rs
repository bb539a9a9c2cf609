//! asrflow CLI entry point.
//!
//! Loads configuration, initializes logging and delegates to the CLI module.

mod cli;

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::parse_cli();
    let config = cli::load_config(&cli)?;

    // Priority: RUST_LOG env var > --log-level > config file > "info"
    let filter = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    asrflow::observability::init_tracing(&filter, cli.log_json || config.log_json)
        .context("failed to install tracing subscriber")?;

    cli::run_with_cli(cli, config).await
}
