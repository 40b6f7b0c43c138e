// src/ledger/sqlite.rs

//! SQLite-backed ledger and state cache

use super::{FileLedger, LedgerEntry, StateCache, now, schema};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        debug!("Opened agent store at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::IoError("agent store lock poisoned".to_string()))
    }
}

impl FileLedger for SqliteStore {
    fn checksum_for(&self, path: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let checksum = conn
            .query_row(
                "SELECT checksum FROM file_ledger WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(checksum)
    }

    fn record(&self, path: &str, checksum: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO file_ledger (path, checksum, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                checksum = excluded.checksum,
                updated_at = excluded.updated_at",
            params![path, checksum, now()],
        )?;
        Ok(())
    }

    fn forget(&self, path: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM file_ledger WHERE path = ?1", [path])?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT path, checksum, updated_at FROM file_ledger ORDER BY path")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    path: row.get(0)?,
                    checksum: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl StateCache for SqliteStore {
    fn load_state(&self) -> Result<Option<String>> {
        let conn = self.conn()?;
        let document = conn
            .query_row("SELECT document FROM state_cache WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(document)
    }

    fn store_state(&self, document: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO state_cache (id, document, fetched_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                fetched_at = excluded.fetched_at",
            params![document, now()],
        )?;
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, now()],
        )?;
        Ok(())
    }
}
