// src/lock.rs

//! Process-wide agent lock
//!
//! One agent process reconciles a device at a time. `watch` holds the lock
//! for its whole lifetime; a one-shot `run` takes it for the duration of the
//! pass and refuses to start when a watcher owns the device.
//!
//! The in-process single-flight guard lives in [`crate::pipeline::PassGuard`];
//! this lock only arbitrates between processes.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive `flock` on the agent lock file
pub struct AgentLock {
    // Kept open to hold the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl AgentLock {
    /// Acquire the lock, blocking until available
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;

        file.lock_exclusive()
            .map_err(|e| Error::IoError(format!("Failed to acquire agent lock: {}", e)))?;

        info!("Acquired agent lock at {:?}", path);
        Ok(Self { file, path })
    }

    /// Try to acquire the lock without blocking
    ///
    /// `Ok(None)` means another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired agent lock at {:?}", path);
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Agent lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(Error::IoError(format!(
                "Failed to try-acquire agent lock: {}",
                e
            ))),
        }
    }

    /// Whether some process holds the lock, without taking it
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let Ok(file) = File::open(path.as_ref()) else {
            return false;
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded by the current holder, if any
    pub fn holder_pid<P: AsRef<Path>>(lock_path: P) -> Option<u32> {
        fs::read_to_string(lock_path.as_ref().with_extension("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Record our PID next to the lock file
    pub fn write_pid(&self) -> Result<()> {
        fs::write(self.path.with_extension("pid"), std::process::id().to_string())?;
        Ok(())
    }
}

impl Drop for AgentLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
        info!("Released agent lock at {:?}", self.path);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}
