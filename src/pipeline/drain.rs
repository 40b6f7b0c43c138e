// src/pipeline/drain.rs

//! Queue construction and drain stages
//!
//! Each drain call handles exactly one queue item so the driver sees every
//! step. A failed download puts the item back at the front and halts the
//! pass; removals are best effort and never halt.
//!
//! Silent installs complete asynchronously. The drain registers the install
//! with the correlator, submits it and suspends; `AwaitInstall` consumes
//! package events until that install resolves and then resumes the drain.

use super::template::TemplateValues;
use super::{PassRun, Pipeline, Shared, StageOutcome, blocking};
use crate::error::{Error, Result};
use crate::install::{Artifact, Correlation, PendingInstall};
use crate::model::{AppSpec, FileSpec, LOCAL_FILE_URL_PREFIX, MARKET_URL_PREFIX};
use crate::reconcile::{build_app_queue, build_file_queue};
use crate::version::is_any_version;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Move a file, falling back to copy + fsync + delete across filesystems
pub(crate) fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "Cross-filesystem move ({} -> {}), copying",
                src.display(),
                dst.display()
            );

            fs::copy(src, dst)?;
            File::open(dst)?.sync_all()?;

            // Directory fsync is unsupported on some filesystems
            if let Some(parent) = dst.parent()
                && let Ok(dir) = File::open(parent)
            {
                let _ = dir.sync_all();
            }

            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Put a downloaded file at its final location
///
/// Templates are read, substituted and written out; everything else is
/// moved. The download is gone afterwards either way.
fn place_file(temp: &Path, target: &Path, template: Option<&TemplateValues>) -> io::Result<()> {
    let result = (|| {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_if_present(target)?;

        match template {
            Some(values) => {
                // Invalid UTF-8 is replaced rather than failing the file forever
                let bytes = fs::read(temp)?;
                fs::write(target, values.apply(&String::from_utf8_lossy(&bytes)))?;
                remove_if_present(temp)
            }
            None => move_file_atomic(temp, target),
        }
    })();

    if result.is_err() {
        let _ = remove_if_present(temp);
    }
    result
}

impl Pipeline {
    pub(super) async fn build_files(
        &self,
        run: &mut PassRun,
        shared: &mut Shared,
    ) -> Result<StageOutcome> {
        let specs = run.state.files.clone();
        let probe = Arc::clone(&self.platform.files);
        let ledger = Arc::clone(&self.ledger);

        shared.files = blocking(move || build_file_queue(&specs, &*probe, &*ledger)).await?;
        info!("{} file operations queued", shared.files.len());
        Ok(StageOutcome::Continue)
    }

    pub(super) async fn drain_file(
        &self,
        run: &mut PassRun,
        shared: &mut Shared,
    ) -> Result<StageOutcome> {
        let Some(spec) = shared.files.pop_front() else {
            return Ok(StageOutcome::Drained);
        };

        if spec.remove {
            self.remove_file(&spec).await;
            return Ok(StageOutcome::Continue);
        }

        match self.provision_file(&spec, run).await {
            Ok(()) => Ok(StageOutcome::Continue),
            Err(e) => {
                warn!("Failed to provision {}: {}", spec.path, e);
                self.observer.on_file_download_error(&spec);
                shared.files.push_front(spec);
                Ok(StageOutcome::Halted)
            }
        }
    }

    async fn remove_file(&self, spec: &FileSpec) {
        let path = match self.platform.files.resolve(&spec.path) {
            Ok(path) => path,
            Err(e) => {
                warn!("Not removing {}: {}", spec.path, e);
                return;
            }
        };

        info!("Removing {}", path.display());
        match blocking(move || remove_if_present(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to remove {}: {}", spec.path, e),
            Err(e) => warn!("Failed to remove {}: {}", spec.path, e),
        }

        if let Err(e) = self.ledger.forget(&spec.path) {
            warn!("Failed to forget {}: {}", spec.path, e);
        }
    }

    async fn provision_file(&self, spec: &FileSpec, run: &PassRun) -> Result<()> {
        let url = spec
            .url()
            .ok_or_else(|| Error::Download(format!("no URL for {}", spec.path)))?;
        let target = self.platform.files.resolve(&spec.path)?;

        self.observer.on_file_downloading(spec);
        let observer = &self.observer;
        let progress =
            |percent: u8, total: u64, current: u64| observer.on_download_progress(percent, total, current);
        let temp = self
            .platform
            .downloader
            .download_to_temp(url, &progress)
            .await?;

        let template = spec
            .is_template
            .then(|| TemplateValues::new(&run.device_id, &run.state));
        blocking(move || place_file(&temp, &target, template.as_ref())).await??;

        if let Err(e) = self.ledger.record(&spec.path, &spec.checksum) {
            warn!("Failed to record {} in the ledger: {}", spec.path, e);
        }
        info!("Provisioned {}", spec.path);
        Ok(())
    }

    pub(super) async fn build_apps(
        &self,
        run: &mut PassRun,
        shared: &mut Shared,
    ) -> Result<StageOutcome> {
        self.observer.on_app_update_start();

        let apps = run.state.applications.clone();
        let packages = Arc::clone(&self.platform.packages);
        shared.apps = blocking(move || build_app_queue(&apps, &*packages)).await?;
        shared.events = Some(self.platform.packages.subscribe());

        info!("{} application operations queued", shared.apps.len());
        Ok(StageOutcome::Continue)
    }

    pub(super) async fn drain_app(&self, shared: &mut Shared) -> StageOutcome {
        let Some(spec) = shared.apps.pop_front() else {
            shared.events = None;
            return StageOutcome::Drained;
        };

        if spec.remove {
            self.remove_app(&spec).await;
            return StageOutcome::Continue;
        }

        let Some(url) = spec.url().map(str::to_string) else {
            return StageOutcome::Continue;
        };

        if url.starts_with(MARKET_URL_PREFIX) {
            info!("Opening store listing for {}", spec.package_id);
            match self
                .platform
                .packages
                .open_store_listing(&url, &spec.package_id)
                .await
            {
                Ok(()) if spec.run_after_install => shared.apps_to_run.push(spec),
                Ok(()) => {}
                Err(e) => warn!("Failed to open store for {}: {}", spec.package_id, e),
            }
            return StageOutcome::Continue;
        }

        let artifact = if url.starts_with(LOCAL_FILE_URL_PREFIX) {
            match local_artifact(&url) {
                Some(path) => Artifact::local(path),
                None => {
                    warn!("Local package {} not found", url);
                    self.observer.on_app_download_error(&spec);
                    shared.apps.push_front(spec);
                    return StageOutcome::Halted;
                }
            }
        } else {
            self.observer.on_app_downloading(&spec);
            let observer = &self.observer;
            let progress = |percent: u8, total: u64, current: u64| {
                observer.on_download_progress(percent, total, current)
            };
            match self
                .platform
                .downloader
                .download_to_temp(&url, &progress)
                .await
            {
                Ok(path) => Artifact::downloaded(path),
                Err(e) => {
                    warn!("Failed to download {}: {}", spec.package_id, e);
                    self.observer.on_app_download_error(&spec);
                    shared.apps.push_front(spec);
                    return StageOutcome::Halted;
                }
            }
        };

        self.observer.on_app_installing(&spec);
        self.install_app(spec, artifact, shared).await
    }

    async fn remove_app(&self, spec: &AppSpec) {
        self.observer.on_app_removing(spec);
        let packages = &self.platform.packages;

        let result = if packages.is_privileged() {
            info!("Silently removing app {}", spec.package_id);
            packages.silent_uninstall(&spec.package_id).await
        } else {
            info!("Asking user to remove app {}", spec.package_id);
            packages.request_user_uninstall(&spec.package_id).await
        };
        if let Err(e) = result {
            warn!("Failed to remove {}: {}", spec.package_id, e);
        }
    }

    async fn install_app(
        &self,
        spec: AppSpec,
        artifact: Artifact,
        shared: &mut Shared,
    ) -> StageOutcome {
        let packages = &self.platform.packages;

        if !packages.is_privileged() {
            info!("Asking user to install app {}", spec.display_name());
            match packages.request_user_install(&artifact.path).await {
                Ok(()) if spec.run_after_install => shared.apps_to_run.push(spec),
                Ok(()) => {}
                Err(e) => {
                    warn!("Failed to request install of {}: {}", spec.package_id, e);
                    artifact.discard();
                }
            }
            return StageOutcome::Continue;
        }

        let version = if is_any_version(&spec.version) {
            String::new()
        } else {
            format!(" {}", spec.version)
        };
        info!("Silently installing app {}{}", spec.display_name(), version);

        if shared.events.is_none() {
            shared.events = Some(packages.subscribe());
        }

        let package_id = spec.package_id.clone();
        let path = artifact.path.clone();
        shared.correlator.register(spec, artifact);

        match packages.silent_install(&path, &package_id).await {
            Ok(()) => StageOutcome::Suspended,
            Err(e) => {
                error!("Failed to submit install of {}: {}", package_id, e);
                if let Some(pending) = shared.correlator.cancel(&package_id) {
                    pending.artifact.discard();
                }
                self.observer.on_app_install_error(&package_id);
                StageOutcome::Continue
            }
        }
    }

    pub(super) async fn await_install(&self, shared: &mut Shared) -> StageOutcome {
        let packages = &self.platform.packages;

        loop {
            if shared.correlator.is_empty() {
                return StageOutcome::Resumed;
            }
            let Some(events) = shared.events.as_mut() else {
                self.fail_pending(shared, "no install event channel");
                return StageOutcome::Resumed;
            };

            let received = match self.config.install_timeout {
                Some(limit) => tokio::time::timeout(limit, events.recv()).await.ok(),
                None => Some(events.recv().await),
            };

            let event = match received {
                Some(Ok(event)) => event,
                Some(Err(RecvError::Lagged(missed))) => {
                    warn!("Missed {} install events", missed);
                    continue;
                }
                Some(Err(RecvError::Closed)) => {
                    shared.events = None;
                    self.fail_pending(shared, "install event channel closed");
                    return StageOutcome::Resumed;
                }
                None => {
                    self.fail_pending(shared, "timed out waiting for install");
                    return StageOutcome::Resumed;
                }
            };

            debug!(
                "Install event for {}: {}",
                event.package_id,
                event.status.name()
            );

            match shared.correlator.correlate(&event, packages.own_package()) {
                Correlation::ForwardConfirmation(intent) => {
                    if let Err(e) = packages.present_confirmation(&intent).await {
                        warn!("Failed to show install confirmation: {}", e);
                    }
                }
                Correlation::ConfirmationRejected(reason) => {
                    error!("Intent redirection detected: {}", reason);
                }
                Correlation::Ignored => {}
                Correlation::Installed(pending) => {
                    self.install_succeeded(pending, shared).await;
                    return StageOutcome::Resumed;
                }
                Correlation::Failed {
                    pending,
                    status,
                    message,
                } => {
                    error!(
                        "Install failed: {}, extra: {}",
                        status,
                        message.as_deref().unwrap_or("")
                    );
                    pending.artifact.discard();
                    self.observer.on_app_install_error(&pending.spec.package_id);
                    return StageOutcome::Resumed;
                }
            }
        }
    }

    async fn install_succeeded(&self, pending: PendingInstall, shared: &mut Shared) {
        let PendingInstall { spec, artifact } = pending;
        artifact.discard();

        if self.platform.device.is_device_owner()
            && let Err(e) = self.platform.packages.grant_permissions(&spec.package_id).await
        {
            warn!("Failed to grant permissions to {}: {}", spec.package_id, e);
        }

        info!("Installed {}", spec.package_id);
        self.observer.on_app_install_complete(&spec.package_id);
        if spec.run_after_install {
            shared.apps_to_run.push(spec);
        }
    }

    fn fail_pending(&self, shared: &mut Shared, reason: &str) {
        for pending in shared.correlator.drain() {
            error!("Install of {} abandoned: {}", pending.spec.package_id, reason);
            pending.artifact.discard();
            self.observer.on_app_install_error(&pending.spec.package_id);
        }
    }
}

/// Path of an existing `file:///` package
fn local_artifact(url: &str) -> Option<PathBuf> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .filter(|path| path.is_file())
}
