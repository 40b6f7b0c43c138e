// src/reconcile/files.rs

//! File queue construction
//!
//! Diffs the desired file list against what is on the device. The ledger
//! records the checksum of every file this agent provisioned; a ledger hit
//! with a matching checksum is trusted without hashing the file again. Only a
//! ledger miss pays for an on-device checksum, and a match on that path
//! backfills the ledger so the next pass is cheap again.
//!
//! The ledger is an optimization. If it is empty or unreadable every present
//! file is simply verified on disk.

use super::queue::ReconciliationQueue;
use crate::error::Result;
use crate::hash::checksums_match;
use crate::ledger::FileLedger;
use crate::model::FileSpec;
use std::path::PathBuf;
use tracing::{debug, warn};

/// On-device view of provisioned files, relative to the storage root
pub trait FileProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    /// Checksum of the file as currently stored
    fn checksum(&self, path: &str) -> Result<String>;

    /// Absolute location of `path`; rejects paths escaping the storage root
    fn resolve(&self, path: &str) -> Result<PathBuf>;
}

/// Why a file spec was or was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    /// Present and marked for removal
    Remove,
    /// Not on the device yet
    Missing,
    /// Ledger records a different checksum
    Outdated,
    /// No ledger entry and the on-device checksum differs
    Mismatch,
    /// Removal requested but nothing to remove
    AlreadyAbsent,
    /// Ledger checksum matches
    Current,
    /// No ledger entry, on-device checksum matches (ledger backfilled)
    Verified,
    /// Neither a removal nor downloadable
    NoSource,
}

impl FileDecision {
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            Self::Remove | Self::Missing | Self::Outdated | Self::Mismatch
        )
    }
}

/// Decide what to do with a single spec
pub fn decide_file<P, L>(spec: &FileSpec, probe: &P, ledger: &L) -> FileDecision
where
    P: FileProbe + ?Sized,
    L: FileLedger + ?Sized,
{
    if spec.remove {
        return if probe.exists(&spec.path) {
            FileDecision::Remove
        } else {
            FileDecision::AlreadyAbsent
        };
    }

    if spec.url().is_none() {
        return FileDecision::NoSource;
    }

    if !probe.exists(&spec.path) {
        return FileDecision::Missing;
    }

    let recorded = match ledger.checksum_for(&spec.path) {
        Ok(recorded) => recorded,
        Err(e) => {
            warn!("Ledger lookup failed for {}: {}, verifying on disk", spec.path, e);
            None
        }
    };

    if let Some(recorded) = recorded {
        return if checksums_match(&recorded, &spec.checksum) {
            FileDecision::Current
        } else {
            FileDecision::Outdated
        };
    }

    match probe.checksum(&spec.path) {
        Ok(actual) if checksums_match(&actual, &spec.checksum) => {
            if let Err(e) = ledger.record(&spec.path, &spec.checksum) {
                warn!("Failed to backfill ledger for {}: {}", spec.path, e);
            }
            FileDecision::Verified
        }
        Ok(actual) => {
            debug!(
                "Checksum mismatch for {}: expected {}, found {}",
                spec.path, spec.checksum, actual
            );
            FileDecision::Mismatch
        }
        Err(e) => {
            warn!("Failed to checksum {}: {}", spec.path, e);
            FileDecision::Mismatch
        }
    }
}

/// Every spec paired with its decision, in document order
pub fn plan_files<P, L>(specs: &[FileSpec], probe: &P, ledger: &L) -> Vec<(FileSpec, FileDecision)>
where
    P: FileProbe + ?Sized,
    L: FileLedger + ?Sized,
{
    specs
        .iter()
        .map(|spec| {
            let decision = decide_file(spec, probe, ledger);
            debug!("File {}: {:?}", spec.path, decision);
            (spec.clone(), decision)
        })
        .collect()
}

/// Build the queue of file operations for one pass
pub fn build_file_queue<P, L>(
    specs: &[FileSpec],
    probe: &P,
    ledger: &L,
) -> ReconciliationQueue<FileSpec>
where
    P: FileProbe + ?Sized,
    L: FileLedger + ?Sized,
{
    plan_files(specs, probe, ledger)
        .into_iter()
        .filter(|(_, decision)| decision.is_queued())
        .map(|(spec, _)| spec)
        .collect()
}
