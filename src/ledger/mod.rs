// src/ledger/mod.rs

//! Local persistent state
//!
//! Two concerns live here:
//!
//! - the file ledger, one `path -> checksum` row per file this agent
//!   provisioned, used to skip re-verifying unchanged files
//! - the state cache, the last successfully fetched desired-state document
//!   kept verbatim for degraded-mode passes, plus a few agent settings
//!
//! Both are synchronous; every call is a single indexed SQLite statement.

mod memory;
pub mod paths;
pub mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// Setting key for a device number assigned by the server
pub const SETTING_DEVICE_ID: &str = "device_id";

/// Setting key for a base URL reached through server migration
pub const SETTING_SERVER_URL: &str = "server_url";

/// A provisioned file record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub path: String,
    pub checksum: String,
    pub updated_at: String,
}

/// `path -> checksum` record of provisioned files
pub trait FileLedger: Send + Sync {
    fn checksum_for(&self, path: &str) -> Result<Option<String>>;

    /// Insert or replace the entry for `path`
    fn record(&self, path: &str, checksum: &str) -> Result<()>;

    fn forget(&self, path: &str) -> Result<()>;

    fn entries(&self) -> Result<Vec<LedgerEntry>>;
}

/// Cached desired state and agent settings
pub trait StateCache: Send + Sync {
    /// Raw document from the last successful fetch
    fn load_state(&self) -> Result<Option<String>>;

    fn store_state(&self, document: &str) -> Result<()>;

    fn setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
