// src/config.rs

//! Agent configuration file
//!
//! TOML with the following sections:
//! - [server] - management server URLs, project, shared secret
//! - [device] - device number, privileges, first-contact create options
//! - [storage] - data directory, provisioned-file root, checksum algorithm
//! - [pipeline] - retry delay, guard policy, install timeout, watch interval
//! - [commands] - shell templates for the package manager and device control

use crate::hash::HashAlgorithm;
use crate::ledger::paths;
use crate::pipeline::{DEFAULT_INSTALL_TIMEOUT, DEFAULT_REQUEST_SECRET, GuardPolicy, PipelineConfig};
use crate::platform::DeviceCreateOptions;
use crate::platform::http::{HTTP_TIMEOUT, HttpServerOptions};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mdm-agent/agent.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub device: DeviceSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub commands: CommandsSection,
}

/// Management server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Primary base URL (required)
    #[serde(default)]
    pub url: String,

    /// Tried when the primary gives no response
    #[serde(default)]
    pub secondary_url: Option<String>,

    /// Path prefix between the base URL and the REST endpoints
    #[serde(default)]
    pub project: String,

    /// Shared secret for request and response signatures
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Require `X-Response-Signature` on desired-state responses
    #[serde(default)]
    pub verify_response: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            secondary_url: None,
            project: String::new(),
            secret: default_secret(),
            verify_response: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Device identity and privileges
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    /// Initial device number; a server-assigned number stored in the
    /// database takes precedence
    #[serde(default)]
    pub id: Option<String>,

    /// Package name of the agent itself
    #[serde(default = "default_own_package")]
    pub own_package: String,

    /// Silent install/uninstall available
    #[serde(default = "default_true")]
    pub privileged: bool,

    #[serde(default = "default_true")]
    pub device_owner: bool,

    #[serde(default = "default_true")]
    pub admin: bool,

    /// Sent on first contact so the server can create the device record
    #[serde(default)]
    pub customer: Option<String>,

    #[serde(default)]
    pub configuration: Option<String>,

    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: None,
            own_package: default_own_package(),
            privileged: true,
            device_owner: true,
            admin: true,
            customer: None,
            configuration: None,
            groups: None,
        }
    }
}

/// Local storage settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root that provisioned file paths are relative to
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub checksum: HashAlgorithm,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            root: None,
            checksum: HashAlgorithm::default(),
        }
    }
}

/// Pipeline behavior
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    /// Delay before the single fetch retry
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default)]
    pub guard: GuardPolicy,

    /// Stop instead of continuing with the cached state when offline
    #[serde(default)]
    pub abort_on_error: bool,

    /// Give up on a silent install after this long (0 waits forever)
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// Seconds between passes in watch mode
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
            guard: GuardPolicy::default(),
            abort_on_error: false,
            install_timeout_secs: default_install_timeout_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Shell templates for the reference platform adapters
///
/// Placeholders: `{file}`, `{package}`, `{url}`, `{password}`,
/// `{restrictions}`, `{action}`, `{target}`. An unset template makes the
/// corresponding operation unsupported.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandsSection {
    pub install: Option<String>,
    pub user_install: Option<String>,
    pub uninstall: Option<String>,
    pub user_uninstall: Option<String>,
    /// Prints the installed version; empty output or a non-zero exit means
    /// not installed
    pub query_version: Option<String>,
    pub store: Option<String>,
    pub grant_permissions: Option<String>,
    pub confirm: Option<String>,
    pub factory_reset: Option<String>,
    pub reboot: Option<String>,
    pub reset_password: Option<String>,
    pub get_launcher: Option<String>,
    pub set_launcher: Option<String>,
    pub clear_launcher: Option<String>,
    pub lock_restrictions: Option<String>,
    pub release_restrictions: Option<String>,
    pub apply_action: Option<String>,
}

fn default_secret() -> String {
    DEFAULT_REQUEST_SECRET.to_string()
}

fn default_install_timeout_secs() -> u64 {
    DEFAULT_INSTALL_TIMEOUT.as_secs()
}

fn default_timeout_secs() -> u64 {
    HTTP_TIMEOUT.as_secs()
}

fn default_own_package() -> String {
    "mdm-agent".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_DATA_DIR)
}

fn default_retry_delay_secs() -> u64 {
    15
}

fn default_interval_secs() -> u64 {
    900
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.server.url.trim();
        if url.is_empty() {
            anyhow::bail!("server.url is required");
        }
        url::Url::parse(url).with_context(|| format!("Invalid server.url: {}", url))?;

        if let Some(secondary) = &self.server.secondary_url {
            url::Url::parse(secondary.trim())
                .with_context(|| format!("Invalid server.secondary_url: {}", secondary))?;
        }

        if self.server.timeout_secs == 0 {
            anyhow::bail!("server.timeout_secs must be greater than 0");
        }

        if self.pipeline.interval_secs == 0 {
            anyhow::bail!("pipeline.interval_secs must be greater than 0");
        }

        Ok(())
    }

    /// Set the server URL
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server.url = url.into();
        self
    }

    /// Set the data directory
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage.data_dir = path.into();
        self
    }

    /// Set the provisioned-file root
    pub fn with_storage_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage.root = Some(path.into());
        self
    }

    /// Stop when offline instead of continuing with the cached state
    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.pipeline.abort_on_error = abort;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        paths::db_path(&self.storage.data_dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        paths::temp_dir(&self.storage.data_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        paths::lock_path(&self.storage.data_dir)
    }

    /// Provisioned-file root, `<data_dir>/files` unless configured
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("files"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.interval_secs)
    }

    pub fn server_options(&self) -> HttpServerOptions {
        HttpServerOptions {
            base_url: self.server.url.clone(),
            secondary_url: self.server.secondary_url.clone(),
            project: self.server.project.clone(),
            secret: self.server.secret.clone(),
            verify_response: self.server.verify_response,
            timeout: self.http_timeout(),
        }
    }

    pub fn create_options(&self) -> Option<DeviceCreateOptions> {
        let options = DeviceCreateOptions {
            customer: self.device.customer.clone(),
            configuration: self.device.configuration.clone(),
            groups: self.device.groups.clone(),
        };
        (!options.is_empty()).then_some(options)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default()
            .with_retry_delay(Duration::from_secs(self.pipeline.retry_delay_secs))
            .with_guard_policy(self.pipeline.guard)
            .with_abort_on_error(self.pipeline.abort_on_error)
            .with_request_secret(self.server.secret.clone())
            .with_create_options(self.create_options());

        config.install_timeout = match self.pipeline.install_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        if let Some(id) = &self.device.id {
            config = config.with_device_id(id.clone());
        }
        config
    }
}
