// src/main.rs

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands, LedgerCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_str();

    match cli.command {
        Some(Commands::Init { device_id }) => commands::cmd_init(config, device_id),
        Some(Commands::Run {
            abort_on_error,
            skip_failed,
            retries,
            quiet,
        }) => commands::cmd_run(config, abort_on_error, skip_failed, retries, quiet).await,
        Some(Commands::Watch { interval }) => commands::cmd_watch(config, interval).await,
        Some(Commands::Plan { state, all }) => commands::cmd_plan(config, state.as_deref(), all),
        Some(Commands::Ledger(LedgerCommands::List)) => commands::cmd_ledger_list(config),
        Some(Commands::Ledger(LedgerCommands::Forget { path })) => {
            commands::cmd_ledger_forget(config, &path)
        }
        Some(Commands::Compare { v1, v2 }) => commands::cmd_compare(&v1, &v2),
        None => {
            println!("mdm-agent: no command given. Run with --help for usage.");
            Ok(())
        }
    }
}
