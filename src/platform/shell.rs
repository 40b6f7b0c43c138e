// src/platform/shell.rs

//! Package manager and device control driven by shell command templates
//!
//! Each operation is a template from the `[commands]` configuration section.
//! Templates are split on whitespace first and placeholders substituted per
//! argument afterwards, so substituted values never get re-split and are
//! never interpreted by a shell.
//!
//! Silent installs complete asynchronously: the install command is spawned,
//! the call returns, and when the command exits an [`InstallEvent`] is
//! published on the broadcast channel. Exit status 0 is success; other exit
//! codes map onto installer failure categories.

use super::{DeviceControl, PackageManager};
use crate::config::CommandsSection;
use crate::error::{Error, Result};
use crate::install::{ConfirmationIntent, FailureKind, InstallEvent};
use crate::model::DeviceAction;
use crate::reconcile::InstalledProbe;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the install event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Split a template into program and arguments, substituting placeholders
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<Vec<String>> {
    let args: Vec<String> = template
        .split_whitespace()
        .map(|arg| {
            vars.iter().fold(arg.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect();

    if args.is_empty() {
        return Err(Error::Config(format!("Empty command template: {:?}", template)));
    }
    Ok(args)
}

fn command(args: &[String]) -> Command {
    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Run a rendered command to completion, returning trimmed stdout
async fn run(name: &str, args: &[String]) -> Result<String> {
    debug!("Running {} command: {:?}", name, args);
    let output = command(args)
        .output()
        .await
        .map_err(|e| Error::IoError(format!("Failed to run {} command {}: {e}", name, args[0])))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::IoError(format!(
            "{} command exited with {}: {}",
            name,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Blocking variant for the synchronous probes
fn run_blocking(name: &str, args: &[String]) -> Option<String> {
    let output = std::process::Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| warn!("Failed to run {} command {}: {}", name, args[0], e))
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!stdout.is_empty()).then_some(stdout)
}

fn template<'a>(template: &'a Option<String>, name: &str) -> Result<&'a str> {
    template
        .as_deref()
        .ok_or_else(|| Error::Unsupported(format!("no {} command configured", name)))
}

/// Package manager backed by command templates
pub struct ShellPackageManager {
    commands: Arc<CommandsSection>,
    own_package: String,
    privileged: bool,
    events: broadcast::Sender<InstallEvent>,
}

impl ShellPackageManager {
    pub fn new(commands: Arc<CommandsSection>, own_package: impl Into<String>, privileged: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            commands,
            own_package: own_package.into(),
            privileged,
            events,
        }
    }
}

impl InstalledProbe for ShellPackageManager {
    fn installed_version(&self, package_id: &str) -> Option<String> {
        let template = self.commands.query_version.as_deref()?;
        let args = render(template, &[("package", package_id)]).ok()?;
        run_blocking("query_version", &args)
    }
}

#[async_trait]
impl PackageManager for ShellPackageManager {
    fn is_privileged(&self) -> bool {
        self.privileged && self.commands.install.is_some()
    }

    fn own_package(&self) -> &str {
        &self.own_package
    }

    fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    async fn silent_install(&self, artifact: &Path, package_id: &str) -> Result<()> {
        let file = artifact.to_string_lossy();
        let args = render(
            template(&self.commands.install, "install")?,
            &[("file", &*file), ("package", package_id)],
        )?;

        debug!("Running install command: {:?}", args);
        let child = command(&args)
            .spawn()
            .map_err(|e| Error::Install(format!("Failed to start installer for {}: {e}", package_id)))?;

        let events = self.events.clone();
        let package_id = package_id.to_string();
        tokio::spawn(async move {
            let event = match child.wait_with_output().await {
                Ok(output) if output.status.success() => InstallEvent::success(&package_id),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    InstallEvent::failure(
                        &package_id,
                        FailureKind::from_code(output.status.code().unwrap_or(1)),
                        (!stderr.is_empty()).then_some(stderr),
                    )
                }
                Err(e) => InstallEvent::failure(&package_id, FailureKind::Unknown, Some(e.to_string())),
            };

            if events.send(event).is_err() {
                debug!("No subscriber for install event of {}", package_id);
            }
        });

        Ok(())
    }

    async fn request_user_install(&self, artifact: &Path) -> Result<()> {
        let file = artifact.to_string_lossy();
        let args = render(template(&self.commands.user_install, "user_install")?, &[("file", &*file)])?;
        run("user_install", &args)
            .await
            .map(|_| ())
            .map_err(|e| Error::Install(e.to_string()))
    }

    async fn silent_uninstall(&self, package_id: &str) -> Result<()> {
        let args = render(template(&self.commands.uninstall, "uninstall")?, &[("package", package_id)])?;
        run("uninstall", &args).await.map(|_| ())
    }

    async fn request_user_uninstall(&self, package_id: &str) -> Result<()> {
        let args = render(
            template(&self.commands.user_uninstall, "user_uninstall")?,
            &[("package", package_id)],
        )?;
        run("user_uninstall", &args).await.map(|_| ())
    }

    async fn open_store_listing(&self, url: &str, package_id: &str) -> Result<()> {
        let args = render(
            template(&self.commands.store, "store")?,
            &[("url", url), ("package", package_id)],
        )?;
        run("store", &args).await.map(|_| ())
    }

    async fn grant_permissions(&self, package_id: &str) -> Result<()> {
        let Some(template) = self.commands.grant_permissions.as_deref() else {
            debug!("No grant_permissions command, skipping {}", package_id);
            return Ok(());
        };
        let args = render(template, &[("package", package_id)])?;
        run("grant_permissions", &args).await.map(|_| ())
    }

    async fn present_confirmation(&self, intent: &ConfirmationIntent) -> Result<()> {
        let target = intent.target_package.as_deref().unwrap_or("");
        let args = render(
            template(&self.commands.confirm, "confirm")?,
            &[("action", intent.action.as_str()), ("target", target)],
        )?;
        run("confirm", &args).await.map(|_| ())
    }
}

/// Device control backed by command templates
pub struct ShellDevice {
    commands: Arc<CommandsSection>,
    device_owner: bool,
    admin: bool,
}

impl ShellDevice {
    pub fn new(commands: Arc<CommandsSection>, device_owner: bool, admin: bool) -> Self {
        Self {
            commands,
            device_owner,
            admin,
        }
    }

    async fn run_template(&self, name: &str, template: &Option<String>, vars: &[(&str, &str)]) -> Result<()> {
        let args = render(self::template(template, name)?, vars)?;
        run(name, &args).await.map(|_| ())
    }

    /// Restriction templates are optional; a missing one is a no-op
    async fn run_restrictions(&self, name: &str, template: &Option<String>, restrictions: &str) -> Result<()> {
        if template.is_none() {
            debug!("No {} command configured", name);
            return Ok(());
        }
        self.run_template(name, template, &[("restrictions", restrictions)])
            .await
    }
}

#[async_trait]
impl DeviceControl for ShellDevice {
    fn is_device_owner(&self) -> bool {
        self.device_owner
    }

    fn is_admin(&self) -> bool {
        self.admin
    }

    async fn factory_reset(&self) -> Result<()> {
        info!("Running factory reset");
        self.run_template("factory_reset", &self.commands.factory_reset, &[])
            .await
    }

    async fn reboot(&self) -> Result<()> {
        info!("Running reboot");
        self.run_template("reboot", &self.commands.reboot, &[]).await
    }

    async fn reset_password(&self, password: &str) -> Result<()> {
        self.run_template(
            "reset_password",
            &self.commands.reset_password,
            &[("password", password)],
        )
        .await
    }

    fn default_launcher(&self) -> Option<String> {
        let template = self.commands.get_launcher.as_deref()?;
        let args = render(template, &[]).ok()?;
        run_blocking("get_launcher", &args)
    }

    async fn set_default_launcher(&self, package_id: &str) -> Result<()> {
        self.run_template(
            "set_launcher",
            &self.commands.set_launcher,
            &[("package", package_id)],
        )
        .await
    }

    async fn clear_default_launcher(&self, package_id: &str) -> Result<()> {
        self.run_template(
            "clear_launcher",
            &self.commands.clear_launcher,
            &[("package", package_id)],
        )
        .await
    }

    async fn lock_restrictions(&self, restrictions: &str) -> Result<()> {
        self.run_restrictions("lock_restrictions", &self.commands.lock_restrictions, restrictions)
            .await
    }

    async fn release_restrictions(&self, restrictions: &str) -> Result<()> {
        self.run_restrictions(
            "release_restrictions",
            &self.commands.release_restrictions,
            restrictions,
        )
        .await
    }

    async fn apply_action(&self, action: &DeviceAction) -> Result<()> {
        let target = action.package_id.as_deref().unwrap_or("");
        self.run_template(
            "apply_action",
            &self.commands.apply_action,
            &[("action", action.action.as_str()), ("package", target)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_substitutes_per_argument() {
        let args = render(
            "pm install -r {file}",
            &[("file", "/tmp/my app.apk"), ("package", "com.x")],
        )
        .unwrap();
        assert_eq!(args, vec!["pm", "install", "-r", "/tmp/my app.apk"]);

        assert!(render("   ", &[]).is_err());
    }

    #[tokio::test]
    async fn test_missing_template_unsupported() {
        let pm = ShellPackageManager::new(Arc::new(CommandsSection::default()), "agent", true);
        assert!(!pm.is_privileged());
        assert!(matches!(
            pm.silent_uninstall("com.x").await,
            Err(Error::Unsupported(_))
        ));
        assert_eq!(pm.installed_version("com.x"), None);
        pm.grant_permissions("com.x").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_install_publishes_event() {
        let commands = CommandsSection {
            install: Some("true {file}".to_string()),
            ..Default::default()
        };
        let pm = ShellPackageManager::new(Arc::new(commands), "agent", true);
        let mut events = pm.subscribe();

        pm.silent_install(Path::new("/tmp/a.apk"), "com.mail").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, InstallEvent::success("com.mail"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_install_maps_exit_code() {
        let commands = CommandsSection {
            install: Some("false {file}".to_string()),
            ..Default::default()
        };
        let pm = ShellPackageManager::new(Arc::new(commands), "agent", true);
        let mut events = pm.subscribe();

        pm.silent_install(Path::new("/tmp/a.apk"), "com.mail").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.package_id, "com.mail");
        assert!(matches!(
            event.status,
            crate::install::InstallStatus::Failure {
                kind: FailureKind::Unknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_restriction_template_is_noop() {
        let device = ShellDevice::new(Arc::new(CommandsSection::default()), true, true);
        device.lock_restrictions("no_sms").await.unwrap();
        device.release_restrictions("no_sms").await.unwrap();
        assert!(device.reboot().await.is_err());
        assert_eq!(device.default_launcher(), None);
    }
}
