// src/cli.rs

//! CLI definitions for the device agent
//!
//! Command implementations live in the `commands` module.

use clap::{Parser, Subcommand};
use mdm_agent::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "mdm-agent")]
#[command(version)]
#[command(about = "Reconciles device files, applications and policies against a management server", long_about = None)]
pub struct Cli {
    /// Path to the agent configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory, storage root and database
    Init {
        /// Device number to use until the server assigns one
        #[arg(long)]
        device_id: Option<String>,
    },

    /// Run one reconciliation pass
    Run {
        /// Stop instead of continuing with the cached state when offline
        #[arg(long)]
        abort_on_error: bool,

        /// Skip a failed download after the retries are used up
        #[arg(long)]
        skip_failed: bool,

        /// Times to retry a failed download before giving up
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Log progress instead of drawing progress bars
        #[arg(short, long)]
        quiet: bool,
    },

    /// Run passes periodically until interrupted
    Watch {
        /// Seconds between passes (overrides pipeline.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show the file and application operations a pass would queue
    Plan {
        /// Desired-state JSON to plan against instead of the cached document
        #[arg(long)]
        state: Option<String>,

        /// Include entries that need no work
        #[arg(short, long)]
        all: bool,
    },

    /// Inspect the provisioned-file ledger
    #[command(subcommand)]
    Ledger(LedgerCommands),

    /// Compare two version strings
    Compare {
        v1: String,
        v2: String,
    },
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// List provisioned files and their recorded checksums
    List,

    /// Drop a ledger entry so the file is verified on disk next pass
    Forget {
        /// Storage-relative path
        path: String,
    },
}
