// tests/common/mod.rs

//! Shared test utilities: an in-process mock platform for pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mdm_agent::{Error, Result};
use mdm_agent::hash::Hasher;
use mdm_agent::install::{ConfirmationIntent, FailureKind, InstallEvent};
use mdm_agent::model::{DeviceAction, PushMode};
use mdm_agent::observer::{CallbackObserver, ObserverEvent};
use mdm_agent::platform::storage::StorageProbe;
use mdm_agent::platform::{
    ConfigServer, DeviceControl, Downloader, FetchRequest, PackageManager, Platform, ProgressFn,
    PushService, TracingRemoteLog,
};
use mdm_agent::reconcile::InstalledProbe;
use mdm_agent::{HashAlgorithm, MemoryStore, Pipeline, PipelineConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const SERVER_URL: &str = "https://mdm.example.com";

/// MD5 hex of `content`, the checksum format the server sends
pub fn md5(content: &[u8]) -> String {
    let mut hasher = Hasher::new(HashAlgorithm::Md5);
    hasher.update(content);
    hasher.finalize()
}

/// Configuration server returning scripted responses
pub struct MockServer {
    script: Mutex<VecDeque<Result<String>>>,
    document: Mutex<String>,
    url: Mutex<String>,
    reachable_migrations: Mutex<HashSet<String>>,
    pub requests: Mutex<Vec<FetchRequest>>,
    pub confirm: Mutex<bool>,
    pub confirmations: Mutex<Vec<String>>,
    /// Delay before answering a fetch
    pub latency: Mutex<Duration>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            document: Mutex::new("{}".to_string()),
            url: Mutex::new(SERVER_URL.to_string()),
            reachable_migrations: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            confirm: Mutex::new(true),
            confirmations: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Document returned once the script is exhausted
    pub fn set_document(&self, json: &str) {
        *self.document.lock().unwrap() = json.to_string();
    }

    /// Queue one response ahead of the default document
    pub fn push_response(&self, response: Result<String>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn fail_network(&self, times: usize) {
        for _ in 0..times {
            self.push_response(Err(Error::Network("connection refused".into())));
        }
    }

    pub fn allow_migration(&self, url: &str) {
        self.reachable_migrations.lock().unwrap().insert(url.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigServer for MockServer {
    async fn fetch_desired_state(&self, request: &FetchRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.document.lock().unwrap().clone()))
    }

    async fn confirm_device_reset(&self, device_id: &str) -> Result<bool> {
        self.confirmations.lock().unwrap().push(format!("reset:{device_id}"));
        Ok(*self.confirm.lock().unwrap())
    }

    async fn confirm_reboot(&self, device_id: &str) -> Result<bool> {
        self.confirmations.lock().unwrap().push(format!("reboot:{device_id}"));
        Ok(*self.confirm.lock().unwrap())
    }

    async fn confirm_password_reset(&self, device_id: &str) -> Result<bool> {
        self.confirmations.lock().unwrap().push(format!("password:{device_id}"));
        Ok(*self.confirm.lock().unwrap())
    }

    fn current_url(&self) -> String {
        self.url()
    }

    async fn migrate(&self, new_url: &str, _request: &FetchRequest) -> Result<()> {
        if self.reachable_migrations.lock().unwrap().contains(new_url) {
            *self.url.lock().unwrap() = new_url.to_string();
            Ok(())
        } else {
            Err(Error::Network(format!("{new_url} unreachable")))
        }
    }
}

/// How the mock package manager answers a silent install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallBehavior {
    /// Publish SUCCESS and mark the package installed
    Succeed,
    /// Publish the given failure
    Fail(FailureKind),
    /// Publish nothing; the test emits events itself
    Manual,
    /// Return an error from the submission call
    Reject,
}

pub struct MockPackages {
    installed: Mutex<HashMap<String, String>>,
    privileged: bool,
    behavior: Mutex<InstallBehavior>,
    events: broadcast::Sender<InstallEvent>,
    pub calls: Mutex<Vec<String>>,
    pub submitted: AtomicUsize,
}

impl MockPackages {
    pub const OWN_PACKAGE: &'static str = "com.example.agent";

    pub fn new(privileged: bool) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            installed: Mutex::new(HashMap::new()),
            privileged,
            behavior: Mutex::new(InstallBehavior::Succeed),
            events,
            calls: Mutex::new(Vec::new()),
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn install(&self, package_id: &str, version: &str) {
        self.installed
            .lock()
            .unwrap()
            .insert(package_id.to_string(), version.to_string());
    }

    pub fn set_behavior(&self, behavior: InstallBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn emit(&self, event: InstallEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn version_of(&self, package_id: &str) -> Option<String> {
        self.installed.lock().unwrap().get(package_id).cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl InstalledProbe for MockPackages {
    fn installed_version(&self, package_id: &str) -> Option<String> {
        self.version_of(package_id)
    }
}

#[async_trait]
impl PackageManager for MockPackages {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn own_package(&self) -> &str {
        Self::OWN_PACKAGE
    }

    fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    async fn silent_install(&self, artifact: &Path, package_id: &str) -> Result<()> {
        self.record(format!("silent_install:{package_id}"));
        self.submitted.fetch_add(1, Ordering::SeqCst);
        assert!(artifact.exists(), "artifact missing at submission");

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            InstallBehavior::Succeed => {
                self.install(package_id, "installed");
                self.emit(InstallEvent::success(package_id));
            }
            InstallBehavior::Fail(kind) => {
                self.emit(InstallEvent::failure(package_id, kind, Some("mock failure".into())));
            }
            InstallBehavior::Manual => {}
            InstallBehavior::Reject => {
                return Err(Error::Install("installer unavailable".into()));
            }
        }
        Ok(())
    }

    async fn request_user_install(&self, artifact: &Path) -> Result<()> {
        self.record(format!("user_install:{}", artifact.display()));
        Ok(())
    }

    async fn silent_uninstall(&self, package_id: &str) -> Result<()> {
        self.record(format!("silent_uninstall:{package_id}"));
        self.installed.lock().unwrap().remove(package_id);
        Ok(())
    }

    async fn request_user_uninstall(&self, package_id: &str) -> Result<()> {
        self.record(format!("user_uninstall:{package_id}"));
        Ok(())
    }

    async fn open_store_listing(&self, _url: &str, package_id: &str) -> Result<()> {
        self.record(format!("store:{package_id}"));
        Ok(())
    }

    async fn grant_permissions(&self, package_id: &str) -> Result<()> {
        self.record(format!("grant:{package_id}"));
        Ok(())
    }

    async fn present_confirmation(&self, intent: &ConfirmationIntent) -> Result<()> {
        self.record(format!("confirm:{}", intent.action));
        Ok(())
    }
}

/// Downloader serving in-memory content
pub struct MockDownloader {
    dir: PathBuf,
    content: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    counter: AtomicUsize,
    pub downloads: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn new(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            content: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            counter: AtomicUsize::new(0),
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn serve(&self, url: &str, content: &[u8]) {
        self.content
            .lock()
            .unwrap()
            .insert(url.to_string(), content.to_vec());
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    /// Files currently left in the download directory
    pub fn leftovers(&self) -> usize {
        std::fs::read_dir(&self.dir).unwrap().count()
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download_to_temp(&self, url: &str, progress: ProgressFn<'_>) -> Result<PathBuf> {
        self.downloads.lock().unwrap().push(url.to_string());
        if self.failing.lock().unwrap().contains(url) {
            return Err(Error::Download(format!("{url}: connection reset")));
        }
        let content = self
            .content
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Download(format!("{url}: 404")))?;

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("download-{n}"));
        std::fs::write(&path, &content)?;
        let len = content.len() as u64;
        progress(100, len, len);
        Ok(path)
    }
}

pub struct MockDevice {
    pub device_owner: bool,
    pub admin: bool,
    pub launcher: Mutex<Option<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockDevice {
    pub fn new(device_owner: bool, admin: bool) -> Self {
        Self {
            device_owner,
            admin,
            launcher: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DeviceControl for MockDevice {
    fn is_device_owner(&self) -> bool {
        self.device_owner
    }

    fn is_admin(&self) -> bool {
        self.admin
    }

    async fn factory_reset(&self) -> Result<()> {
        self.record("factory_reset".into());
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.record("reboot".into());
        Ok(())
    }

    async fn reset_password(&self, password: &str) -> Result<()> {
        self.record(format!("password:{password}"));
        Ok(())
    }

    fn default_launcher(&self) -> Option<String> {
        self.launcher.lock().unwrap().clone()
    }

    async fn set_default_launcher(&self, package_id: &str) -> Result<()> {
        self.record(format!("set_launcher:{package_id}"));
        *self.launcher.lock().unwrap() = Some(package_id.to_string());
        Ok(())
    }

    async fn clear_default_launcher(&self, package_id: &str) -> Result<()> {
        self.record(format!("clear_launcher:{package_id}"));
        *self.launcher.lock().unwrap() = None;
        Ok(())
    }

    async fn lock_restrictions(&self, restrictions: &str) -> Result<()> {
        self.record(format!("lock:{restrictions}"));
        Ok(())
    }

    async fn release_restrictions(&self, restrictions: &str) -> Result<()> {
        self.record(format!("release:{restrictions}"));
        Ok(())
    }

    async fn apply_action(&self, action: &DeviceAction) -> Result<()> {
        self.record(format!("action:{}", action.action));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPush {
    pub connects: Mutex<Vec<(String, PushMode, Duration, String)>>,
    pub disconnects: AtomicUsize,
}

#[async_trait]
impl PushService for MockPush {
    async fn connect(
        &self,
        server_url: &str,
        mode: PushMode,
        keepalive: Duration,
        device_id: &str,
    ) -> Result<()> {
        self.connects.lock().unwrap().push((
            server_url.to_string(),
            mode,
            keepalive,
            device_id.to_string(),
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// A mock platform over a temporary storage root
pub struct Harness {
    pub dir: TempDir,
    pub server: Arc<MockServer>,
    pub packages: Arc<MockPackages>,
    pub downloader: Arc<MockDownloader>,
    pub device: Arc<MockDevice>,
    pub push: Arc<MockPush>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<Mutex<Vec<ObserverEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_privileges(true, true)
    }

    pub fn with_privileges(privileged: bool, device_owner: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        let downloader = MockDownloader::new(dir.path().join("tmp"));

        Self {
            server: Arc::new(MockServer::new()),
            packages: Arc::new(MockPackages::new(privileged)),
            downloader: Arc::new(downloader),
            device: Arc::new(MockDevice::new(device_owner, device_owner)),
            push: Arc::new(MockPush::default()),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            dir,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("files")
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_retry_delay(Duration::from_millis(10))
            .with_device_id("dev-1")
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(self.config())
    }

    pub fn pipeline_with(&self, config: PipelineConfig) -> Pipeline {
        let platform = Platform {
            server: self.server.clone(),
            packages: self.packages.clone(),
            downloader: self.downloader.clone(),
            device: self.device.clone(),
            push: self.push.clone(),
            files: Arc::new(StorageProbe::new(self.root(), HashAlgorithm::Md5)),
            remote_log: Arc::new(TracingRemoteLog),
        };

        let events = Arc::clone(&self.events);
        let observer = CallbackObserver::new(move |event| {
            if !matches!(event, ObserverEvent::DownloadProgress { .. }) {
                events.lock().unwrap().push(event);
            }
        });

        Pipeline::new(platform, self.store.clone(), self.store.clone(), config)
            .with_observer(Arc::new(observer))
    }

    pub fn observed(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_observed(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn read(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(path)).ok()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }
}
