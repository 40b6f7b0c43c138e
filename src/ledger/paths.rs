// src/ledger/paths.rs

//! Centralized path derivation for agent data directories

use std::path::{Path, PathBuf};

/// Default agent data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/mdm-agent";

/// SQLite database holding the ledger, state cache and settings
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agent.db")
}

/// Download staging directory
pub fn temp_dir(data_dir: &Path) -> PathBuf {
    std::env::var("MDM_AGENT_TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("tmp"))
}

/// Process lock held while passes run
pub fn lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agent.lock")
}
