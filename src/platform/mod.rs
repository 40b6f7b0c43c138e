// src/platform/mod.rs

//! Collaborators the pipeline drives
//!
//! The reconciliation core never touches the network, the package installer
//! or device policy APIs directly. Each of those surfaces is a trait here so
//! the pipeline can be exercised against in-memory fakes and wired to real
//! backends by the binary.
//!
//! Reference adapters:
//! - [`http`]: management server transport and artifact downloader
//! - [`shell`]: package manager and device control driven by command templates
//! - [`storage`]: file probe over a local storage root

pub mod http;
pub mod shell;
pub mod storage;

use crate::error::Result;
use crate::install::{ConfirmationIntent, InstallEvent};
use crate::model::{DeviceAction, PushMode};
use crate::reconcile::{FileProbe, InstalledProbe};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Options that let the server create the device record on first contact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCreateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

impl DeviceCreateOptions {
    pub fn is_empty(&self) -> bool {
        self.customer.is_none() && self.configuration.is_none() && self.groups.is_none()
    }
}

/// One desired-state request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub device_id: String,
    /// SHA-1 hex of the shared secret followed by the device id
    pub signature: String,
    /// Only sent before any document has been cached
    pub create_options: Option<DeviceCreateOptions>,
}

/// Desired-state transport
///
/// Implementations classify every failure as `Error::Network` (no response
/// from any endpoint), `Error::Server` (an answer that is not a usable
/// document) or `Error::Verification` (signature mismatch).
#[async_trait]
pub trait ConfigServer: Send + Sync {
    /// Fetch the desired-state document as raw JSON
    async fn fetch_desired_state(&self, request: &FetchRequest) -> Result<String>;

    /// Acknowledge a factory reset; `Ok(false)` means the server declined
    async fn confirm_device_reset(&self, device_id: &str) -> Result<bool>;

    async fn confirm_reboot(&self, device_id: &str) -> Result<bool>;

    async fn confirm_password_reset(&self, device_id: &str) -> Result<bool>;

    /// Base URL currently in use
    fn current_url(&self) -> String;

    /// Probe `new_url` with `request` and switch to it on success
    async fn migrate(&self, new_url: &str, request: &FetchRequest) -> Result<()>;
}

/// Package installer and its completion channel
#[async_trait]
pub trait PackageManager: InstalledProbe + Send + Sync {
    /// Silent install and uninstall are available
    fn is_privileged(&self) -> bool;

    /// Package name of the agent itself
    fn own_package(&self) -> &str;

    /// Completion events for silent installs, keyed by package name
    fn subscribe(&self) -> broadcast::Receiver<InstallEvent>;

    /// Submit a silent install; the outcome arrives on the event channel
    async fn silent_install(&self, artifact: &Path, package_id: &str) -> Result<()>;

    /// Hand the artifact to the user-facing installer
    async fn request_user_install(&self, artifact: &Path) -> Result<()>;

    async fn silent_uninstall(&self, package_id: &str) -> Result<()>;

    async fn request_user_uninstall(&self, package_id: &str) -> Result<()>;

    /// Open a store listing for a `market://` URL
    async fn open_store_listing(&self, url: &str, package_id: &str) -> Result<()>;

    async fn grant_permissions(&self, package_id: &str) -> Result<()>;

    /// Show an installer confirmation to the user
    async fn present_confirmation(&self, intent: &ConfirmationIntent) -> Result<()>;
}

/// Download progress sink: percent, total bytes (0 if unknown), bytes so far
pub type ProgressFn<'a> = &'a (dyn Fn(u8, u64, u64) + Send + Sync);

/// Artifact transfer
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` into the temp directory; partial files are removed on failure
    async fn download_to_temp(&self, url: &str, progress: ProgressFn<'_>) -> Result<PathBuf>;
}

/// Device policy primitives
#[async_trait]
pub trait DeviceControl: Send + Sync {
    fn is_device_owner(&self) -> bool;

    fn is_admin(&self) -> bool;

    async fn factory_reset(&self) -> Result<()>;

    async fn reboot(&self) -> Result<()>;

    async fn reset_password(&self, password: &str) -> Result<()>;

    /// Package currently registered as the default launcher
    fn default_launcher(&self) -> Option<String>;

    async fn set_default_launcher(&self, package_id: &str) -> Result<()>;

    async fn clear_default_launcher(&self, package_id: &str) -> Result<()>;

    /// Apply a comma-separated restriction list
    async fn lock_restrictions(&self, restrictions: &str) -> Result<()>;

    async fn release_restrictions(&self, restrictions: &str) -> Result<()>;

    async fn apply_action(&self, action: &DeviceAction) -> Result<()>;
}

/// Push channel setup
#[async_trait]
pub trait PushService: Send + Sync {
    async fn connect(
        &self,
        server_url: &str,
        mode: PushMode,
        keepalive: Duration,
        device_id: &str,
    ) -> Result<()>;

    async fn disconnect(&self);
}

/// Push service for deployments without a push channel
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPush;

#[async_trait]
impl PushService for NoPush {
    async fn connect(
        &self,
        server_url: &str,
        mode: PushMode,
        _keepalive: Duration,
        _device_id: &str,
    ) -> Result<()> {
        info!("Push mode {} requested for {}, no push channel configured", mode.as_str(), server_url);
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Operator diagnostics sink
///
/// Defaults forward to tracing under the `remote` target.
pub trait RemoteLog: Send + Sync {
    fn info(&self, message: &str) {
        info!(target: "remote", "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(target: "remote", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "remote", "{}", message);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRemoteLog;

impl RemoteLog for TracingRemoteLog {}

/// Every collaborator a pipeline needs
#[derive(Clone)]
pub struct Platform {
    pub server: Arc<dyn ConfigServer>,
    pub packages: Arc<dyn PackageManager>,
    pub downloader: Arc<dyn Downloader>,
    pub device: Arc<dyn DeviceControl>,
    pub push: Arc<dyn PushService>,
    pub files: Arc<dyn FileProbe>,
    pub remote_log: Arc<dyn RemoteLog>,
}
