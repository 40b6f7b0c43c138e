// src/commands.rs

//! Command handlers for the agent CLI

use anyhow::{Context, Result};
use mdm_agent::config::AgentConfig;
use mdm_agent::ledger::{FileLedger, LedgerEntry, MemoryStore, SETTING_DEVICE_ID, SETTING_SERVER_URL, SqliteStore, StateCache};
use mdm_agent::lock::AgentLock;
use mdm_agent::model::DesiredState;
use mdm_agent::observer::{CliObserver, LogObserver, Observer};
use mdm_agent::pipeline::{PassOutcome, Pipeline, QueueHead};
use mdm_agent::platform::http::{HttpConfigServer, HttpDownloader};
use mdm_agent::platform::shell::{ShellDevice, ShellPackageManager};
use mdm_agent::platform::storage::StorageProbe;
use mdm_agent::platform::{NoPush, Platform, TracingRemoteLog};
use mdm_agent::reconcile::{plan_apps, plan_files};
use mdm_agent::scheduler::PassScheduler;
use mdm_agent::version;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build a pipeline wired to the reference adapters
fn open_pipeline(config: &AgentConfig, observer: Arc<dyn Observer>) -> Result<Pipeline> {
    let store = Arc::new(
        SqliteStore::open(config.db_path())
            .with_context(|| format!("Failed to open {}", config.db_path().display()))?,
    );

    let mut options = config.server_options();
    if let Some(url) = store.setting(SETTING_SERVER_URL)? {
        info!("Using migrated server URL {}", url);
        options.base_url = url;
    }

    let storage_root = config.storage_root();
    std::fs::create_dir_all(&storage_root)
        .with_context(|| format!("Failed to create {}", storage_root.display()))?;

    let commands = Arc::new(config.commands.clone());
    let platform = Platform {
        server: Arc::new(HttpConfigServer::new(options)?),
        packages: Arc::new(ShellPackageManager::new(
            Arc::clone(&commands),
            config.device.own_package.clone(),
            config.device.privileged,
        )),
        downloader: Arc::new(HttpDownloader::new(
            config.temp_dir(),
            config.server.secret.clone(),
            config.http_timeout(),
        )?),
        device: Arc::new(ShellDevice::new(
            commands,
            config.device.device_owner,
            config.device.admin,
        )),
        push: Arc::new(NoPush),
        files: Arc::new(StorageProbe::new(storage_root, config.storage.checksum)),
        remote_log: Arc::new(TracingRemoteLog),
    };

    let ledger: Arc<dyn FileLedger> = store.clone();
    Ok(Pipeline::new(platform, ledger, store, config.pipeline_config()).with_observer(observer))
}

fn take_lock(config: &AgentConfig) -> Result<AgentLock> {
    let path = config.lock_path();
    match AgentLock::try_acquire(&path)? {
        Some(lock) => Ok(lock),
        None => {
            let holder = AgentLock::holder_pid(&path)
                .map(|pid| format!(" (pid {})", pid))
                .unwrap_or_default();
            anyhow::bail!("Another agent process holds {}{}", path.display(), holder)
        }
    }
}

pub fn cmd_init(config_path: &str, device_id: Option<String>) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))?;

    for dir in [config.storage.data_dir.clone(), config.storage_root(), config.temp_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let store = SqliteStore::open(config.db_path())?;
    if let Some(id) = device_id.or(config.device.id.clone()) {
        store.set_setting(SETTING_DEVICE_ID, &id)?;
        println!("Device number: {}", id);
    }

    println!("Initialized agent state at {}", config.storage.data_dir.display());
    Ok(())
}

pub async fn cmd_run(
    config_path: &str,
    abort_on_error: bool,
    skip_failed: bool,
    retries: u32,
    quiet: bool,
) -> Result<()> {
    let mut config = AgentConfig::load(Path::new(config_path))?;
    if abort_on_error {
        config = config.with_abort_on_error(true);
    }

    let _lock = take_lock(&config)?;
    let observer: Arc<dyn Observer> = if quiet {
        Arc::new(LogObserver)
    } else {
        Arc::new(CliObserver::new())
    };
    let pipeline = open_pipeline(&config, observer)?;

    let outcome = pipeline.run_pass().await?;
    let outcome = resolve_halts(&pipeline, outcome, retries, skip_failed).await?;

    for app in pipeline.take_apps_to_run().await {
        println!("Ready to launch: {}", app.package_id);
    }
    report(&outcome)
}

/// Retry a halted queue head, then optionally skip it, until the pass ends
async fn resolve_halts(
    pipeline: &Pipeline,
    mut outcome: PassOutcome,
    retries: u32,
    skip_failed: bool,
) -> Result<PassOutcome> {
    let mut attempts = 0;

    loop {
        let is_app = match &outcome {
            PassOutcome::Halted(QueueHead::App(_)) => true,
            PassOutcome::Halted(QueueHead::File(_)) => false,
            _ => return Ok(outcome),
        };

        outcome = if attempts < retries {
            attempts += 1;
            info!("Retrying halted queue (attempt {} of {})", attempts, retries);
            if is_app {
                pipeline.retry_apps().await?
            } else {
                pipeline.retry_files().await?
            }
        } else if skip_failed {
            attempts = 0;
            if is_app {
                pipeline.skip_app().await?
            } else {
                pipeline.skip_file().await?
            }
        } else {
            return Ok(outcome);
        };
    }
}

fn report(outcome: &PassOutcome) -> Result<()> {
    match outcome {
        PassOutcome::Completed => {
            println!("Device is up to date");
            Ok(())
        }
        PassOutcome::AlreadyRunning => {
            println!("A pass is already running");
            Ok(())
        }
        PassOutcome::NothingToResume => Ok(()),
        PassOutcome::ServerError => anyhow::bail!("Server rejected the request"),
        PassOutcome::NetworkError => anyhow::bail!("Management server unreachable"),
        PassOutcome::Halted(QueueHead::File(file)) => {
            anyhow::bail!("Stopped at file {}; run again to retry", file.path)
        }
        PassOutcome::Halted(QueueHead::App(app)) => {
            anyhow::bail!("Stopped at application {}; run again to retry", app.package_id)
        }
    }
}

pub async fn cmd_watch(config_path: &str, interval: Option<u64>) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))?;
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.watch_interval());
    if interval.is_zero() {
        anyhow::bail!("--interval must be greater than 0");
    }

    let lock = take_lock(&config)?;
    if let Err(e) = lock.write_pid() {
        warn!("Could not write PID file: {}", e);
    }

    let pipeline = open_pipeline(&config, Arc::new(LogObserver))?;
    let mut scheduler = PassScheduler::new(interval);

    println!("Watching for configuration changes every {:?}", interval);
    println!("Press Ctrl+C to stop.");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        if scheduler.should_run() {
            let outcome = match pipeline.run_pass().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Pass failed: {}", e);
                    PassOutcome::NothingToResume
                }
            };
            info!("Pass finished: {:?}", outcome);
            scheduler.record_pass(outcome);
            info!("{}", scheduler.status_line());
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down after {} passes", scheduler.state().passes);
                break;
            }
            _ = tokio::time::sleep(scheduler.time_until_next()) => {}
        }
    }

    drop(lock);
    Ok(())
}

pub fn cmd_plan(config_path: &str, state_file: Option<&str>, all: bool) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))?;
    let store = SqliteStore::open(config.db_path())?;

    let document = match state_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?,
        None => store
            .load_state()?
            .context("No cached desired state; pass --state or run a pass first")?,
    };
    let state = DesiredState::from_json(&document)?;

    // Plan against a copy of the ledger so verification backfills stay local
    let ledger = MemoryStore::new();
    for entry in store.entries()? {
        ledger.record(&entry.path, &entry.checksum)?;
    }

    let probe = StorageProbe::new(config.storage_root(), config.storage.checksum);
    let packages = ShellPackageManager::new(
        Arc::new(config.commands.clone()),
        config.device.own_package.clone(),
        config.device.privileged,
    );

    println!("Files:");
    for (spec, decision) in plan_files(&state.files, &probe, &ledger) {
        if all || decision.is_queued() {
            println!("  {:<12} {}", format!("{:?}", decision), spec.path);
        }
    }

    println!("Applications:");
    for (spec, decision) in plan_apps(&state.applications, &packages) {
        if all || decision.is_queued() {
            println!("  {:<12} {} {}", format!("{:?}", decision), spec.package_id, spec.version);
        }
    }
    Ok(())
}

pub fn cmd_ledger_list(config_path: &str) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))?;
    let store = SqliteStore::open(config.db_path())?;
    let entries: Vec<LedgerEntry> = store.entries()?;

    if entries.is_empty() {
        println!("No provisioned files recorded");
        return Ok(());
    }
    for entry in entries {
        println!("{}  {}  {}", entry.checksum, entry.updated_at, entry.path);
    }
    Ok(())
}

pub fn cmd_ledger_forget(config_path: &str, path: &str) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))?;
    let store = SqliteStore::open(config.db_path())?;
    store.forget(path)?;
    println!("Forgot {}", path);
    Ok(())
}

pub fn cmd_compare(v1: &str, v2: &str) -> Result<()> {
    let symbol = match version::compare(v1, v2) {
        -1 => "<",
        0 => "=",
        _ => ">",
    };
    println!("{} {} {}", v1, symbol, v2);
    Ok(())
}
