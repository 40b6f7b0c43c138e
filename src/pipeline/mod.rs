// src/pipeline/mod.rs

//! Reconciliation pipeline
//!
//! One pass walks a fixed sequence of stages:
//!
//! ```text
//! Fetch -> [RetryDelay -> Fetch] -> MigrateServer -> SetupPush -> FactoryReset
//!   -> RemoteReboot -> PasswordReset -> DefaultLauncher -> BuildFileQueue
//!   -> DrainFiles* -> BuildAppQueue -> DrainApps* <-> AwaitInstall
//!   -> LockRestrictions -> ApplyActions -> Complete
//! ```
//!
//! Each stage reports a [`StageOutcome`]; [`transition`] maps the pair to the
//! next stage or to the end of the pass. Collaborator failures never escape a
//! stage: they become outcomes, observer callbacks and log records.
//!
//! Concurrency:
//! - a [`PassGuard`] keeps passes single-flight (see [`GuardPolicy`])
//! - every stage after the fetch runs with the pipeline's stage lock held, so
//!   stages of different passes never interleave; the fetch does not take it
//! - the queues, the pending-install correlator and the run list live behind
//!   that lock and are only mutated by whoever holds it
//! - checksums, version probes and file moves run on the blocking pool
//!
//! A drain that fails on its queue head stops the pass with the item still at
//! the front. The operator entry points ([`Pipeline::retry_files`],
//! [`Pipeline::skip_file`] and the app equivalents) resume from there.

mod drain;
mod fetch;
pub mod guard;
mod policies;
pub mod template;

pub use guard::{GuardPolicy, PassGuard, PassToken};

use crate::error::{Error, Result};
use crate::install::{InstallCorrelator, InstallEvent};
use crate::ledger::{FileLedger, SETTING_DEVICE_ID, StateCache};
use crate::model::{AppSpec, DesiredState, FileSpec};
use crate::observer::{LogObserver, Observer};
use crate::platform::{DeviceCreateOptions, Platform};
use crate::reconcile::ReconciliationQueue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, info, warn};

/// Default delay before the single fetch retry
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Default wait for a silent-install event before the install is abandoned
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default shared secret for request signatures
pub const DEFAULT_REQUEST_SECRET: &str = "changeme-C3z9vi54";

/// Pipeline behavior settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delay before re-fetching after a network failure
    pub retry_delay: Duration,
    pub guard_policy: GuardPolicy,
    /// Stop instead of continuing with the cached state when offline
    pub abort_on_error: bool,
    /// Give up waiting for a silent-install event after this long; `None`
    /// waits forever and holds the stage lock while doing so
    pub install_timeout: Option<Duration>,
    pub request_secret: String,
    /// Sent on the first fetch, before any document is cached
    pub create_options: Option<DeviceCreateOptions>,
    /// Device number used until the server assigns one
    pub device_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            guard_policy: GuardPolicy::default(),
            abort_on_error: false,
            install_timeout: Some(DEFAULT_INSTALL_TIMEOUT),
            request_secret: DEFAULT_REQUEST_SECRET.to_string(),
            create_options: None,
            device_id: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_guard_policy(mut self, policy: GuardPolicy) -> Self {
        self.guard_policy = policy;
        self
    }

    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = Some(timeout);
        self
    }

    pub fn with_request_secret(mut self, secret: impl Into<String>) -> Self {
        self.request_secret = secret.into();
        self
    }

    pub fn with_create_options(mut self, options: Option<DeviceCreateOptions>) -> Self {
        self.create_options = options;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Pipeline stages in pass order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetch,
    RetryDelay,
    MigrateServer,
    SetupPush,
    FactoryReset,
    RemoteReboot,
    PasswordReset,
    DefaultLauncher,
    BuildFileQueue,
    DrainFiles,
    BuildAppQueue,
    DrainApps,
    AwaitInstall,
    LockRestrictions,
    ApplyActions,
    Complete,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::RetryDelay => "retry-delay",
            Self::MigrateServer => "migrate-server",
            Self::SetupPush => "setup-push",
            Self::FactoryReset => "factory-reset",
            Self::RemoteReboot => "remote-reboot",
            Self::PasswordReset => "password-reset",
            Self::DefaultLauncher => "default-launcher",
            Self::BuildFileQueue => "build-file-queue",
            Self::DrainFiles => "drain-files",
            Self::BuildAppQueue => "build-app-queue",
            Self::DrainApps => "drain-apps",
            Self::AwaitInstall => "await-install",
            Self::LockRestrictions => "lock-restrictions",
            Self::ApplyActions => "apply-actions",
            Self::Complete => "complete",
        }
    }

    /// Stages that run without the stage lock
    fn is_fetch_phase(&self) -> bool {
        matches!(self, Self::Fetch | Self::RetryDelay)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What a stage reports back to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage finished normally
    Continue,
    /// Fetch failed on the network; retry after the delay
    Retry,
    /// Fetch failed twice; continuing with the cached state
    Degraded,
    ServerError,
    NetworkError,
    /// Server migration succeeded; fetch again from the new server
    Restart,
    /// Queue empty
    Drained,
    /// Silent install submitted; wait for its event
    Suspended,
    /// Pending install resolved
    Resumed,
    /// Queue head failed and was put back
    Halted,
}

/// How a pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Completed,
    ServerError,
    NetworkError,
    Halted,
}

/// Result of the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Goto(Stage),
    Finish(Finish),
}

/// The stage transition table
pub fn transition(stage: Stage, outcome: StageOutcome) -> Step {
    use Stage::*;
    use StageOutcome as O;

    match (stage, outcome) {
        (Fetch, O::Continue | O::Degraded) => Step::Goto(MigrateServer),
        (Fetch, O::Retry) => Step::Goto(RetryDelay),
        (Fetch, O::NetworkError) => Step::Finish(Finish::NetworkError),
        (Fetch, _) => Step::Finish(Finish::ServerError),
        (RetryDelay, _) => Step::Goto(Fetch),
        (MigrateServer, O::Restart) => Step::Goto(Fetch),
        (MigrateServer, _) => Step::Goto(SetupPush),
        (SetupPush, _) => Step::Goto(FactoryReset),
        (FactoryReset, _) => Step::Goto(RemoteReboot),
        (RemoteReboot, _) => Step::Goto(PasswordReset),
        (PasswordReset, _) => Step::Goto(DefaultLauncher),
        (DefaultLauncher, _) => Step::Goto(BuildFileQueue),
        (BuildFileQueue, _) => Step::Goto(DrainFiles),
        (DrainFiles, O::Halted) => Step::Finish(Finish::Halted),
        (DrainFiles, O::Drained) => Step::Goto(BuildAppQueue),
        (DrainFiles, _) => Step::Goto(DrainFiles),
        (BuildAppQueue, _) => Step::Goto(DrainApps),
        (DrainApps, O::Halted) => Step::Finish(Finish::Halted),
        (DrainApps, O::Drained) => Step::Goto(LockRestrictions),
        (DrainApps, O::Suspended) => Step::Goto(AwaitInstall),
        (DrainApps, _) => Step::Goto(DrainApps),
        (AwaitInstall, _) => Step::Goto(DrainApps),
        (LockRestrictions, _) => Step::Goto(ApplyActions),
        (ApplyActions, _) => Step::Goto(Complete),
        (Complete, _) => Step::Finish(Finish::Completed),
    }
}

/// Item left at the front of a halted queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueHead {
    File(FileSpec),
    App(AppSpec),
}

/// How a pass (or a resumed drain) ended
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed,
    /// Another pass holds the guard; nothing was done
    AlreadyRunning,
    ServerError,
    NetworkError,
    /// A drain stopped on this item; retry or skip it to continue
    Halted(QueueHead),
    /// Retry/skip requested but no matching queue is halted
    NothingToResume,
}

/// Pass-local state, owned by the driver
struct PassRun {
    state: DesiredState,
    device_id: String,
    fetch_attempts: u32,
    migrated: bool,
    token: Option<PassToken>,
}

impl PassRun {
    fn new(device_id: String, token: PassToken) -> Self {
        Self {
            state: DesiredState::default(),
            device_id,
            fetch_attempts: 0,
            migrated: false,
            token: Some(token),
        }
    }
}

/// A pass stopped on a queue head, kept for the operator
struct HaltedPass {
    stage: Stage,
    state: DesiredState,
    device_id: String,
}

/// State shared across passes, guarded by the stage lock
#[derive(Default)]
struct Shared {
    files: ReconciliationQueue<FileSpec>,
    apps: ReconciliationQueue<AppSpec>,
    correlator: InstallCorrelator,
    events: Option<broadcast::Receiver<InstallEvent>>,
    apps_to_run: Vec<AppSpec>,
    halted: Option<HaltedPass>,
}

/// The reconciliation pipeline for one device agent
pub struct Pipeline {
    platform: Platform,
    ledger: Arc<dyn FileLedger>,
    cache: Arc<dyn StateCache>,
    observer: Arc<dyn Observer>,
    config: PipelineConfig,
    guard: PassGuard,
    shared: Mutex<Shared>,
}

impl Pipeline {
    pub fn new(
        platform: Platform,
        ledger: Arc<dyn FileLedger>,
        cache: Arc<dyn StateCache>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            platform,
            ledger,
            cache,
            observer: Arc::new(LogObserver),
            config,
            guard: PassGuard::new(),
            shared: Mutex::new(Shared::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether a pass currently holds the guard
    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Run one reconciliation pass
    ///
    /// Returns `AlreadyRunning` without side effects if a pass holds the
    /// guard. Fails only when local state is unusable (no device number,
    /// a blocking task died).
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(token) = self.guard.try_begin() else {
            debug!("Pass already running, ignoring trigger");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let device_id = self.device_id()?;
        info!("Starting reconciliation pass for device {}", device_id);
        self.observer.on_pass_start();
        self.release_cached_restrictions().await;

        let run = PassRun::new(device_id, token);
        self.drive(Stage::Fetch, run, None).await
    }

    /// Re-attempt the head of a halted file queue
    pub async fn retry_files(&self) -> Result<PassOutcome> {
        self.resume(Stage::DrainFiles, false).await
    }

    /// Drop the head of a halted file queue and continue
    ///
    /// The file spec is removed from the cached desired state so it is not
    /// offered again until the next successful fetch.
    pub async fn skip_file(&self) -> Result<PassOutcome> {
        self.resume(Stage::DrainFiles, true).await
    }

    /// Re-attempt the head of a halted application queue
    pub async fn retry_apps(&self) -> Result<PassOutcome> {
        self.resume(Stage::DrainApps, false).await
    }

    /// Drop the head of a halted application queue and continue
    ///
    /// The application's URL is cleared in the cached desired state; the
    /// package itself stays listed because it may already be installed.
    pub async fn skip_app(&self) -> Result<PassOutcome> {
        self.resume(Stage::DrainApps, true).await
    }

    /// Applications installed this pass that asked to be launched
    pub async fn take_apps_to_run(&self) -> Vec<AppSpec> {
        std::mem::take(&mut self.shared.lock().await.apps_to_run)
    }

    pub async fn queued_files(&self) -> Vec<FileSpec> {
        self.shared.lock().await.files.iter().cloned().collect()
    }

    pub async fn queued_apps(&self) -> Vec<AppSpec> {
        self.shared.lock().await.apps.iter().cloned().collect()
    }

    /// Current device number: server-assigned if any, else configured
    pub fn device_id(&self) -> Result<String> {
        match self.cache.setting(SETTING_DEVICE_ID) {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => {}
            Err(e) => warn!("Failed to read stored device number: {}", e),
        }
        self.config
            .device_id
            .clone()
            .ok_or_else(|| Error::Config("no device number configured".to_string()))
    }

    async fn resume(&self, stage: Stage, skip: bool) -> Result<PassOutcome> {
        let Some(token) = self.guard.try_begin() else {
            return Ok(PassOutcome::AlreadyRunning);
        };

        let mut shared = self.shared.lock().await;
        let Some(halted) = shared.halted.take_if(|h| h.stage == stage) else {
            debug!("No halted {} to resume", stage);
            return Ok(PassOutcome::NothingToResume);
        };

        let mut run = PassRun::new(halted.device_id, token);
        run.state = halted.state;

        if skip {
            self.skip_head(stage, &mut run, &mut shared);
        }

        self.drive(stage, run, Some(shared)).await
    }

    /// Pop the halted head and persist its exclusion
    fn skip_head(&self, stage: Stage, run: &mut PassRun, shared: &mut Shared) {
        match stage {
            Stage::DrainFiles => {
                if let Some(spec) = shared.files.pop_front() {
                    info!("Skipping file {} until the next refresh", spec.path);
                    run.state.exclude_file(&spec.path);
                    self.persist_exclusion(|state| state.exclude_file(&spec.path));
                }
            }
            Stage::DrainApps => {
                if let Some(spec) = shared.apps.pop_front() {
                    info!("Skipping {} until the next refresh", spec.package_id);
                    run.state.exclude_app_url(&spec.package_id);
                    self.persist_exclusion(|state| state.exclude_app_url(&spec.package_id));
                }
            }
            _ => {}
        }
    }

    fn persist_exclusion(&self, exclude: impl FnOnce(&mut DesiredState) -> bool) {
        let Some(mut cached) = self.cached_state() else {
            return;
        };
        if !exclude(&mut cached) {
            return;
        }
        let stored = cached
            .to_json()
            .and_then(|json| self.cache.store_state(&json));
        if let Err(e) = stored {
            warn!("Failed to persist skipped item: {}", e);
        }
    }

    /// Last cached desired state, if readable
    fn cached_state(&self) -> Option<DesiredState> {
        let document = match self.cache.load_state() {
            Ok(document) => document?,
            Err(e) => {
                warn!("Failed to read cached desired state: {}", e);
                return None;
            }
        };
        match DesiredState::from_json(&document) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Cached desired state is unreadable: {}", e);
                None
            }
        }
    }

    /// Run stages from `start` until the pass ends
    async fn drive<'a>(
        &'a self,
        start: Stage,
        mut run: PassRun,
        mut shared: Option<MutexGuard<'a, Shared>>,
    ) -> Result<PassOutcome> {
        let mut stage = start;

        loop {
            debug!("Entering stage {}", stage);
            let outcome = if stage.is_fetch_phase() {
                // A restart after migration fetches without the stage lock too
                drop(shared.take());
                match stage {
                    Stage::Fetch => self.fetch(&mut run).await,
                    _ => self.retry_delay().await,
                }
            } else {
                let mut guard = match shared.take() {
                    Some(guard) => guard,
                    None => self.shared.lock().await,
                };
                let outcome = self.execute(stage, &mut run, &mut guard).await?;
                shared = Some(guard);
                outcome
            };

            let step = transition(stage, outcome);
            debug!("Stage {} -> {:?} -> {:?}", stage, outcome, step);

            if stage == Stage::Fetch
                && outcome != StageOutcome::Retry
                && self.config.guard_policy == GuardPolicy::AfterFetch
                && run.token.take().is_some()
            {
                debug!("Guard released after fetch");
            }

            match step {
                Step::Goto(next) => stage = next,
                Step::Finish(finish) => return Ok(self.finish(stage, finish, run, shared)),
            }
        }
    }

    async fn execute(&self, stage: Stage, run: &mut PassRun, shared: &mut Shared) -> Result<StageOutcome> {
        let outcome = match stage {
            Stage::MigrateServer => self.migrate_server(run).await,
            Stage::SetupPush => self.setup_push(run).await,
            Stage::FactoryReset => self.factory_reset(run).await,
            Stage::RemoteReboot => self.remote_reboot(run).await,
            Stage::PasswordReset => self.password_reset(run).await,
            Stage::DefaultLauncher => self.default_launcher(run).await,
            Stage::BuildFileQueue => self.build_files(run, shared).await?,
            Stage::DrainFiles => self.drain_file(run, shared).await?,
            Stage::BuildAppQueue => self.build_apps(run, shared).await?,
            Stage::DrainApps => self.drain_app(shared).await,
            Stage::AwaitInstall => self.await_install(shared).await,
            Stage::LockRestrictions => self.lock_restrictions(run).await,
            Stage::ApplyActions => self.apply_actions(run).await,
            Stage::Complete | Stage::Fetch | Stage::RetryDelay => StageOutcome::Continue,
        };
        Ok(outcome)
    }

    async fn retry_delay(&self) -> StageOutcome {
        info!("Retrying fetch in {:?}", self.config.retry_delay);
        tokio::time::sleep(self.config.retry_delay).await;
        StageOutcome::Continue
    }

    fn finish(
        &self,
        stage: Stage,
        finish: Finish,
        run: PassRun,
        shared: Option<MutexGuard<'_, Shared>>,
    ) -> PassOutcome {
        match finish {
            Finish::Completed => {
                info!("Reconciliation pass complete");
                if let Some(mut shared) = shared {
                    shared.halted = None;
                }
                self.observer.on_pass_complete();
                PassOutcome::Completed
            }
            Finish::ServerError => {
                self.observer.on_server_error();
                PassOutcome::ServerError
            }
            Finish::NetworkError => {
                self.observer.on_network_error();
                PassOutcome::NetworkError
            }
            Finish::Halted => {
                let Some(mut shared) = shared else {
                    return PassOutcome::NothingToResume;
                };
                let head = match stage {
                    Stage::DrainApps => shared.apps.front().cloned().map(QueueHead::App),
                    _ => shared.files.front().cloned().map(QueueHead::File),
                };
                shared.halted = Some(HaltedPass {
                    stage,
                    state: run.state,
                    device_id: run.device_id,
                });
                match head {
                    Some(head) => {
                        info!("Pass halted at {}", stage);
                        PassOutcome::Halted(head)
                    }
                    None => PassOutcome::NothingToResume,
                }
            }
        }
    }
}

/// Run blocking work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::IoError(format!("Blocking task failed: {e}")))
}
