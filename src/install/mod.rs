// src/install/mod.rs

//! Correlating asynchronous install completions with queued applications
//!
//! A silent install returns immediately; the outcome arrives later as an
//! [`InstallEvent`] on the package manager's event channel. The correlator
//! keeps one pending entry per package name and matches events strictly by
//! that name, so an event that shows up after the drain has moved on (or one
//! for a package this agent never submitted) is recognized and ignored
//! rather than misattributed.
//!
//! The correlator is pure bookkeeping. Artifact cleanup, permission grants
//! and observer notifications are performed by the pipeline based on the
//! returned [`Correlation`].

pub mod confirm;

pub use confirm::{ConfirmationIntent, sanitize};

use crate::model::AppSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Installer failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Unknown,
    Blocked,
    Aborted,
    Invalid,
    Conflict,
    Storage,
    Incompatible,
}

impl FailureKind {
    /// Map an installer status code (1..=7) to a category
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::Blocked,
            3 => Self::Aborted,
            4 => Self::Invalid,
            5 => Self::Conflict,
            6 => Self::Storage,
            7 => Self::Incompatible,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "FAILURE_UNKNOWN",
            Self::Blocked => "BLOCKED",
            Self::Aborted => "ABORTED",
            Self::Invalid => "INVALID",
            Self::Conflict => "CONFLICT",
            Self::Storage => "STORAGE",
            Self::Incompatible => "INCOMPATIBLE",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status carried by an install event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    /// The installer needs the user to confirm
    PendingUserAction(ConfirmationIntent),
    Success,
    Failure {
        kind: FailureKind,
        message: Option<String>,
    },
}

impl InstallStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PendingUserAction(_) => "PENDING_USER_ACTION",
            Self::Success => "SUCCESS",
            Self::Failure { kind, .. } => kind.as_str(),
        }
    }
}

/// Out-of-band install outcome, keyed by package name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallEvent {
    pub package_id: String,
    pub status: InstallStatus,
}

impl InstallEvent {
    pub fn success(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            status: InstallStatus::Success,
        }
    }

    pub fn failure(package_id: impl Into<String>, kind: FailureKind, message: Option<String>) -> Self {
        Self {
            package_id: package_id.into(),
            status: InstallStatus::Failure { kind, message },
        }
    }

    pub fn pending_user_action(package_id: impl Into<String>, intent: ConfirmationIntent) -> Self {
        Self {
            package_id: package_id.into(),
            status: InstallStatus::PendingUserAction(intent),
        }
    }
}

/// Package file handed to the installer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Downloaded by the agent and safe to delete
    pub owned: bool,
}

impl Artifact {
    /// A file the agent downloaded into its temp directory
    pub fn downloaded(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: true,
        }
    }

    /// A file that was already on the device
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    /// Delete the artifact if the agent owns it
    ///
    /// Split packages (`.xapk`) are unpacked next to the archive into a
    /// directory of the same stem; that directory goes too.
    pub fn discard(&self) {
        if !self.owned {
            return;
        }

        if self.path.extension().is_some_and(|e| e == "xapk") {
            let unpacked = self.path.with_extension("");
            if unpacked.is_dir()
                && let Err(e) = fs::remove_dir_all(&unpacked)
            {
                warn!("Failed to remove {}: {}", unpacked.display(), e);
            }
        }

        remove_if_exists(&self.path);
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove artifact {}: {}", path.display(), e),
    }
}

/// An install awaiting its completion event
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInstall {
    pub spec: AppSpec,
    pub artifact: Artifact,
}

/// What an event means for the drain
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Show this (sanitized) intent to the user and keep waiting
    ForwardConfirmation(ConfirmationIntent),
    /// The intent failed validation; keep waiting
    ConfirmationRejected(String),
    /// Pending entry resolved successfully
    Installed(PendingInstall),
    /// Pending entry resolved with a failure
    Failed {
        pending: PendingInstall,
        status: String,
        message: Option<String>,
    },
    /// No pending entry for this package
    Ignored,
}

/// Pending installs keyed by package name
#[derive(Debug, Default)]
pub struct InstallCorrelator {
    pending: HashMap<String, PendingInstall>,
}

impl InstallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a submitted silent install
    pub fn register(&mut self, spec: AppSpec, artifact: Artifact) {
        debug!("Awaiting install of {}", spec.package_id);
        if let Some(previous) = self.pending.insert(
            spec.package_id.clone(),
            PendingInstall { spec, artifact },
        ) {
            warn!(
                "Replacing pending install of {}",
                previous.spec.package_id
            );
        }
    }

    /// Drop an entry whose submission failed synchronously
    pub fn cancel(&mut self, package_id: &str) -> Option<PendingInstall> {
        self.pending.remove(package_id)
    }

    /// Match an event to its pending entry
    pub fn correlate(&mut self, event: &InstallEvent, own_package: &str) -> Correlation {
        if !self.pending.contains_key(&event.package_id) {
            debug!(
                "Ignoring {} event for {}: no pending install",
                event.status.name(),
                event.package_id
            );
            return Correlation::Ignored;
        }

        match &event.status {
            InstallStatus::PendingUserAction(intent) => match sanitize(intent, own_package) {
                Ok(forwarded) => Correlation::ForwardConfirmation(forwarded),
                Err(e) => Correlation::ConfirmationRejected(e.to_string()),
            },
            InstallStatus::Success => match self.pending.remove(&event.package_id) {
                Some(pending) => Correlation::Installed(pending),
                None => Correlation::Ignored,
            },
            InstallStatus::Failure { kind, message } => {
                match self.pending.remove(&event.package_id) {
                    Some(pending) => Correlation::Failed {
                        pending,
                        status: kind.as_str().to_string(),
                        message: message.clone(),
                    },
                    None => Correlation::Ignored,
                }
            }
        }
    }

    /// Remove every pending entry, e.g. when the event channel closes
    pub fn drain(&mut self) -> Vec<PendingInstall> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.pending.contains_key(package_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
