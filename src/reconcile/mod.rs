// src/reconcile/mod.rs

//! Diffing the desired state against the device
//!
//! - `files` - which provisioned files to create, update or delete
//! - `apps` - which packages to remove, install, upgrade or downgrade
//! - `queue` - the deque both drains consume

pub mod apps;
pub mod files;
pub mod queue;

pub use apps::{AppDecision, InstalledProbe, build_app_queue, plan_apps};
pub use files::{FileDecision, FileProbe, build_file_queue, decide_file, plan_files};
pub use queue::ReconciliationQueue;
