// src/model/mod.rs

//! Desired-state document issued by the management server
//!
//! The server sends one JSON document per device describing the files,
//! applications and policies the device should converge to. The pipeline
//! treats a fetched document as immutable for the duration of a pass and
//! replaces it wholesale on the next successful fetch.
//!
//! Fields this crate does not act on are kept in `extra` maps so a cached
//! document round-trips without loss.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application type marker for installable packages
pub const APP_TYPE_APPLICATION: &str = "app";

/// URL prefix for store listings
pub const MARKET_URL_PREFIX: &str = "market://details";

/// URL prefix for artifacts already on the device
pub const LOCAL_FILE_URL_PREFIX: &str = "file:///";

/// Push channel modes that require a persistent connection
pub const PUSH_MQTT_WORKER: &str = "mqttWorker";
pub const PUSH_MQTT_ALARM: &str = "mqttAlarm";

/// Restrictions held while a pass may install or remove packages
pub const INSTALL_RESTRICTIONS: &str = "no_install_apps,no_uninstall_apps";

/// A file the server wants present (or absent) on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Path relative to the device storage root; identity key
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub remove: bool,
    /// Content contains placeholders to substitute before writing
    #[serde(default, rename = "varContent")]
    pub is_template: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileSpec {
    pub fn new(path: impl Into<String>, url: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: Some(url.into()),
            checksum: checksum.into(),
            remove: false,
            is_template: false,
            extra: Map::new(),
        }
    }

    pub fn removal(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: None,
            checksum: String::new(),
            remove: true,
            is_template: false,
            extra: Map::new(),
        }
    }

    /// Download URL, treating blank values as absent
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// An application the server wants installed (or removed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Package identifier; identity key
    #[serde(rename = "pkg")]
    pub package_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Requested version; `"0"` accepts any installed version
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub remove: bool,
    #[serde(default, rename = "skipVersion")]
    pub skip_version_check: bool,
    #[serde(default)]
    pub run_after_install: bool,
    /// `None` or `"app"` for packages; web links and intents use other values
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    crate::version::ANY_VERSION.to_string()
}

impl AppSpec {
    pub fn install(
        package_id: impl Into<String>,
        version: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            name: None,
            url: Some(url.into()),
            version: version.into(),
            remove: false,
            skip_version_check: false,
            run_after_install: false,
            app_type: None,
            extra: Map::new(),
        }
    }

    pub fn removal(package_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            name: None,
            url: None,
            version: version.into(),
            remove: true,
            skip_version_check: false,
            run_after_install: false,
            app_type: None,
            extra: Map::new(),
        }
    }

    /// Download URL, treating blank values as absent
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// Whether this entry describes an installable package
    pub fn is_application(&self) -> bool {
        self.app_type
            .as_deref()
            .is_none_or(|t| t == APP_TYPE_APPLICATION)
    }

    /// Human-readable label for logs and UI
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.package_id)
    }
}

/// Device-level intent handler to register (e.g. default browser)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Push channel configuration derived from `pushOptions`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    MqttWorker,
    MqttAlarm,
}

impl PushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MqttWorker => PUSH_MQTT_WORKER,
            Self::MqttAlarm => PUSH_MQTT_ALARM,
        }
    }
}

/// The full desired-state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub applications: Vec<AppSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_reset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_reset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_default_launcher: Option<bool>,
    /// Migration target for the management server base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_server_url: Option<String>,
    /// Server-assigned replacement for the device number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_wifi: Option<bool>,
    /// Comma-separated restriction names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<DeviceAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_options: Option<String>,
    /// Push keepalive in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom3: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DesiredState {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn wants_reboot(&self) -> bool {
        self.reboot.unwrap_or(false)
    }

    pub fn wants_factory_reset(&self) -> bool {
        self.factory_reset.unwrap_or(false)
    }

    pub fn wants_default_launcher_run(&self) -> bool {
        self.run_default_launcher.unwrap_or(false)
    }

    pub fn shows_wifi(&self) -> bool {
        self.show_wifi.unwrap_or(false)
    }

    /// Trimmed migration target, if any
    pub fn migration_target(&self) -> Option<&str> {
        self.new_server_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    pub fn push_mode(&self) -> Option<PushMode> {
        match self.push_options.as_deref() {
            Some(PUSH_MQTT_WORKER) => Some(PushMode::MqttWorker),
            Some(PUSH_MQTT_ALARM) => Some(PushMode::MqttAlarm),
            _ => None,
        }
    }

    pub fn actions(&self) -> &[DeviceAction] {
        self.actions.as_deref().unwrap_or(&[])
    }

    /// Restrictions released at pass start: the cached set plus install locks
    pub fn restrictions_to_release(&self) -> String {
        match self.restrictions.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => format!("{},{}", r, INSTALL_RESTRICTIONS),
            _ => INSTALL_RESTRICTIONS.to_string(),
        }
    }

    /// Drop a file spec until the next refresh
    pub fn exclude_file(&mut self, path: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.path != path);
        self.files.len() != before
    }

    /// Clear an application's URL so it is treated as already satisfied
    pub fn exclude_app_url(&mut self, package_id: &str) -> bool {
        let mut changed = false;
        for app in self
            .applications
            .iter_mut()
            .filter(|a| a.package_id == package_id && !a.remove)
        {
            if app.url.take().is_some() {
                changed = true;
            }
        }
        changed
    }
}
