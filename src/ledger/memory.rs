// src/ledger/memory.rs

//! In-memory ledger and state cache for dry runs and tests

use super::{FileLedger, LedgerEntry, StateCache, now};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    ledger: BTreeMap<String, LedgerEntry>,
    state: Option<String>,
    settings: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a cached desired-state document
    pub fn with_state(document: impl Into<String>) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.state = Some(document.into());
        }
        store
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::IoError("memory store lock poisoned".to_string()))
    }
}

impl FileLedger for MemoryStore {
    fn checksum_for(&self, path: &str) -> Result<Option<String>> {
        Ok(self.inner()?.ledger.get(path).map(|e| e.checksum.clone()))
    }

    fn record(&self, path: &str, checksum: &str) -> Result<()> {
        self.inner()?.ledger.insert(
            path.to_string(),
            LedgerEntry {
                path: path.to_string(),
                checksum: checksum.to_string(),
                updated_at: now(),
            },
        );
        Ok(())
    }

    fn forget(&self, path: &str) -> Result<()> {
        self.inner()?.ledger.remove(path);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.inner()?.ledger.values().cloned().collect())
    }
}

impl StateCache for MemoryStore {
    fn load_state(&self) -> Result<Option<String>> {
        Ok(self.inner()?.state.clone())
    }

    fn store_state(&self, document: &str) -> Result<()> {
        self.inner()?.state = Some(document.to_string());
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner()?.settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
