// src/lib.rs

//! Device agent reconciliation engine
//!
//! Fetches a desired-state document from a management server and drives the
//! device toward it: provisioned files, installed applications and device
//! policies.
//!
//! # Architecture
//!
//! - `reconcile`: pure diffing of desired state against the device, yielding
//!   file and application queues
//! - `pipeline`: the per-pass state machine that fetches, applies policies
//!   and drains both queues
//! - `install`: correlation of asynchronous install events with the installs
//!   the drain submitted
//! - `platform`: collaborator traits (server, package manager, downloader,
//!   device control, push) and their reference adapters
//! - `ledger`: SQLite record of provisioned files and the cached document

pub mod config;
mod error;
pub mod hash;
pub mod install;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod observer;
pub mod pipeline;
pub mod platform;
pub mod reconcile;
pub mod scheduler;
pub mod version;

pub use error::{Error, Result};
pub use hash::HashAlgorithm;
pub use install::{InstallCorrelator, InstallEvent, InstallStatus};
pub use ledger::{FileLedger, MemoryStore, SqliteStore, StateCache};
pub use model::{AppSpec, DesiredState, FileSpec};
pub use observer::{CallbackObserver, CliObserver, LogObserver, Observer, ObserverEvent, SilentObserver};
pub use pipeline::{PassOutcome, Pipeline, PipelineConfig, QueueHead};
pub use platform::Platform;
pub use reconcile::ReconciliationQueue;
