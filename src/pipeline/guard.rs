// src/pipeline/guard.rs

//! Single-flight guard for reconciliation passes
//!
//! A pipeline owns one [`PassGuard`]. Starting a pass takes a [`PassToken`];
//! while any token is alive further triggers are dropped. The token releases
//! the guard when dropped, so a pass that returns early (or panics) never
//! leaves the guard stuck.
//!
//! Where the token is dropped is a policy:
//!
//! - `AtCompletion`: held until the pass finishes, halts or stops
//! - `AfterFetch`: dropped as soon as the fetch stage resolves, which lets a
//!   new trigger fetch again while this pass is still draining its queues

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// When a pass releases the single-flight guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardPolicy {
    #[default]
    AtCompletion,
    AfterFetch,
}

impl fmt::Display for GuardPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtCompletion => write!(f, "at-completion"),
            Self::AfterFetch => write!(f, "after-fetch"),
        }
    }
}

/// Idle/Running state token owned by one pipeline
#[derive(Debug, Clone, Default)]
pub struct PassGuard {
    running: Arc<AtomicBool>,
}

impl PassGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` if a pass is already running
    pub fn try_begin(&self) -> Option<PassToken> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassToken {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Proof that this caller owns the running pass
#[derive(Debug)]
pub struct PassToken {
    running: Arc<AtomicBool>,
}

impl Drop for PassToken {
    fn drop(&mut self) {
        debug!("Releasing pass guard");
        self.running.store(false, Ordering::Release);
    }
}
