// src/observer.rs

//! Milestone notifications from the reconciliation pipeline
//!
//! The pipeline reports user-visible progress exclusively through the
//! [`Observer`] trait. Every callback has a no-op default, so an
//! implementation only overrides what it renders. Implementations:
//!
//! - `SilentObserver`: ignores everything
//! - `LogObserver`: writes milestones to tracing
//! - `CallbackObserver`: forwards owned [`ObserverEvent`]s to a closure
//! - `CliObserver`: indicatif download bar plus terminal messages

use crate::model::{AppSpec, FileSpec};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use tracing::{info, warn};

/// Pipeline milestone callbacks
///
/// Callbacks run on the pipeline task and must not block.
pub trait Observer: Send + Sync {
    fn on_pass_start(&self) {}

    fn on_server_error(&self) {}

    fn on_network_error(&self) {}

    fn on_policies_updated(&self) {}

    fn on_file_downloading(&self, _file: &FileSpec) {}

    /// `percent` is 0-100; `total` is 0 when the size is unknown
    fn on_download_progress(&self, _percent: u8, _total: u64, _current: u64) {}

    fn on_file_download_error(&self, _file: &FileSpec) {}

    fn on_app_update_start(&self) {}

    fn on_app_removing(&self, _app: &AppSpec) {}

    fn on_app_downloading(&self, _app: &AppSpec) {}

    fn on_app_installing(&self, _app: &AppSpec) {}

    fn on_app_download_error(&self, _app: &AppSpec) {}

    fn on_app_install_error(&self, _package_id: &str) {}

    fn on_app_install_complete(&self, _package_id: &str) {}

    fn on_pass_complete(&self) {}
}

/// Owned form of every observer callback
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    PassStart,
    ServerError,
    NetworkError,
    PoliciesUpdated,
    FileDownloading(String),
    DownloadProgress { percent: u8, total: u64, current: u64 },
    FileDownloadError(String),
    AppUpdateStart,
    AppRemoving(String),
    AppDownloading(String),
    AppInstalling(String),
    AppDownloadError(String),
    AppInstallError(String),
    AppInstallComplete(String),
    PassComplete,
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl Observer for SilentObserver {}

/// Observer that logs milestones to tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_pass_start(&self) {
        info!("Configuration update started");
    }

    fn on_server_error(&self) {
        warn!("Configuration update failed: server error");
    }

    fn on_network_error(&self) {
        warn!("Configuration update failed: network error");
    }

    fn on_policies_updated(&self) {
        info!("Device policies updated");
    }

    fn on_file_downloading(&self, file: &FileSpec) {
        info!("Downloading file {}", file.path);
    }

    fn on_file_download_error(&self, file: &FileSpec) {
        warn!("Failed to download file {}", file.path);
    }

    fn on_app_update_start(&self) {
        info!("Updating applications");
    }

    fn on_app_removing(&self, app: &AppSpec) {
        info!("Removing {}", app.display_name());
    }

    fn on_app_downloading(&self, app: &AppSpec) {
        info!("Downloading {}", app.display_name());
    }

    fn on_app_installing(&self, app: &AppSpec) {
        info!("Installing {}", app.display_name());
    }

    fn on_app_download_error(&self, app: &AppSpec) {
        warn!("Failed to download {}", app.display_name());
    }

    fn on_app_install_error(&self, package_id: &str) {
        warn!("Failed to install {}", package_id);
    }

    fn on_app_install_complete(&self, package_id: &str) {
        info!("Installed {}", package_id);
    }

    fn on_pass_complete(&self) {
        info!("Configuration update complete");
    }
}

/// Observer that forwards events to a closure
pub struct CallbackObserver<F>
where
    F: Fn(ObserverEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackObserver<F>
where
    F: Fn(ObserverEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> Observer for CallbackObserver<F>
where
    F: Fn(ObserverEvent) + Send + Sync,
{
    fn on_pass_start(&self) {
        (self.callback)(ObserverEvent::PassStart);
    }

    fn on_server_error(&self) {
        (self.callback)(ObserverEvent::ServerError);
    }

    fn on_network_error(&self) {
        (self.callback)(ObserverEvent::NetworkError);
    }

    fn on_policies_updated(&self) {
        (self.callback)(ObserverEvent::PoliciesUpdated);
    }

    fn on_file_downloading(&self, file: &FileSpec) {
        (self.callback)(ObserverEvent::FileDownloading(file.path.clone()));
    }

    fn on_download_progress(&self, percent: u8, total: u64, current: u64) {
        (self.callback)(ObserverEvent::DownloadProgress {
            percent,
            total,
            current,
        });
    }

    fn on_file_download_error(&self, file: &FileSpec) {
        (self.callback)(ObserverEvent::FileDownloadError(file.path.clone()));
    }

    fn on_app_update_start(&self) {
        (self.callback)(ObserverEvent::AppUpdateStart);
    }

    fn on_app_removing(&self, app: &AppSpec) {
        (self.callback)(ObserverEvent::AppRemoving(app.package_id.clone()));
    }

    fn on_app_downloading(&self, app: &AppSpec) {
        (self.callback)(ObserverEvent::AppDownloading(app.package_id.clone()));
    }

    fn on_app_installing(&self, app: &AppSpec) {
        (self.callback)(ObserverEvent::AppInstalling(app.package_id.clone()));
    }

    fn on_app_download_error(&self, app: &AppSpec) {
        (self.callback)(ObserverEvent::AppDownloadError(app.package_id.clone()));
    }

    fn on_app_install_error(&self, package_id: &str) {
        (self.callback)(ObserverEvent::AppInstallError(package_id.to_string()));
    }

    fn on_app_install_complete(&self, package_id: &str) {
        (self.callback)(ObserverEvent::AppInstallComplete(package_id.to_string()));
    }

    fn on_pass_complete(&self) {
        (self.callback)(ObserverEvent::PassComplete);
    }
}

/// Terminal observer with a download progress bar
pub struct CliObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl Default for CliObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl CliObserver {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn start_bar(&self, name: &str) {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_message(name.to_string());
        if let Ok(mut slot) = self.bar.lock()
            && let Some(old) = slot.replace(pb)
        {
            old.finish_and_clear();
        }
    }

    fn finish_bar(&self, message: Option<String>) {
        if let Ok(mut slot) = self.bar.lock()
            && let Some(pb) = slot.take()
        {
            match message {
                Some(msg) => pb.abandon_with_message(msg),
                None => pb.finish_and_clear(),
            }
        }
    }
}

impl Observer for CliObserver {
    fn on_pass_start(&self) {
        println!("Updating configuration...");
    }

    fn on_server_error(&self) {
        self.finish_bar(None);
        eprintln!("Server error: configuration not updated");
    }

    fn on_network_error(&self) {
        self.finish_bar(None);
        eprintln!("Network error: management server unreachable");
    }

    fn on_policies_updated(&self) {
        println!("Policies updated");
    }

    fn on_file_downloading(&self, file: &FileSpec) {
        self.start_bar(&file.path);
    }

    fn on_download_progress(&self, _percent: u8, total: u64, current: u64) {
        if let Ok(slot) = self.bar.lock()
            && let Some(pb) = slot.as_ref()
        {
            if total > 0 && pb.length() != Some(total) {
                pb.set_length(total);
            }
            pb.set_position(current);
        }
    }

    fn on_file_download_error(&self, file: &FileSpec) {
        self.finish_bar(Some(format!("{} [FAILED]", file.path)));
    }

    fn on_app_update_start(&self) {
        self.finish_bar(None);
        println!("Updating applications...");
    }

    fn on_app_removing(&self, app: &AppSpec) {
        println!("Removing {}", app.display_name());
    }

    fn on_app_downloading(&self, app: &AppSpec) {
        self.start_bar(app.display_name());
    }

    fn on_app_installing(&self, app: &AppSpec) {
        self.finish_bar(None);
        println!("Installing {}", app.display_name());
    }

    fn on_app_download_error(&self, app: &AppSpec) {
        self.finish_bar(Some(format!("{} [FAILED]", app.display_name())));
    }

    fn on_app_install_error(&self, package_id: &str) {
        eprintln!("Failed to install {}", package_id);
    }

    fn on_app_install_complete(&self, package_id: &str) {
        println!("Installed {}", package_id);
    }

    fn on_pass_complete(&self) {
        self.finish_bar(None);
        println!("Configuration up to date");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_callback_observer_forwards_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer = CallbackObserver::new(move |e| sink.lock().unwrap().push(e));

        let file = FileSpec::new("a.txt", "https://x/a.txt", "CK");
        observer.on_pass_start();
        observer.on_file_downloading(&file);
        observer.on_download_progress(50, 200, 100);
        observer.on_app_install_error("com.example");
        observer.on_pass_complete();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ObserverEvent::PassStart,
                ObserverEvent::FileDownloading("a.txt".into()),
                ObserverEvent::DownloadProgress {
                    percent: 50,
                    total: 200,
                    current: 100
                },
                ObserverEvent::AppInstallError("com.example".into()),
                ObserverEvent::PassComplete,
            ]
        );
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        let observer = SilentObserver;
        let app = AppSpec::install("com.example", "1.0", "https://x/app.apk");
        observer.on_app_installing(&app);
        observer.on_download_progress(100, 1, 1);
        observer.on_pass_complete();
    }
}
