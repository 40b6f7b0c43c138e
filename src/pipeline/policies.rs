// src/pipeline/policies.rs

//! Device policy stages
//!
//! None of these stages can stop a pass. A declined confirmation, a missing
//! permission or a failed device call is reported to the remote log and the
//! pass moves on.

use super::{PassRun, Pipeline, StageOutcome};
use crate::ledger::SETTING_SERVER_URL;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keepalive used when the document asks for less than the minimum
pub const DEFAULT_KEEPALIVE_SECS: u32 = 300;
pub const MIN_KEEPALIVE_SECS: u32 = 30;

/// Compare base URLs ignoring case and trailing slashes
fn same_server(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

impl Pipeline {
    /// Lift restrictions left locked by the previous pass
    pub(super) async fn release_cached_restrictions(&self) {
        let Some(cached) = self.cached_state() else {
            return;
        };
        if cached
            .restrictions
            .as_deref()
            .is_none_or(|r| r.trim().is_empty())
        {
            return;
        }

        let restrictions = cached.restrictions_to_release();
        debug!("Releasing restrictions: {}", restrictions);
        if let Err(e) = self
            .platform
            .device
            .release_restrictions(&restrictions)
            .await
        {
            warn!("Failed to release restrictions: {}", e);
        }
    }

    pub(super) async fn migrate_server(&self, run: &mut PassRun) -> StageOutcome {
        if run.migrated {
            return StageOutcome::Continue;
        }
        let Some(target) = run.state.migration_target().map(str::to_string) else {
            return StageOutcome::Continue;
        };
        if same_server(&target, &self.platform.server.current_url()) {
            return StageOutcome::Continue;
        }
        if let Err(e) = url::Url::parse(&target) {
            warn!("Ignoring invalid migration target {}: {}", target, e);
            return StageOutcome::Continue;
        }

        let request = self.fetch_request(&run.device_id, false);
        match self.platform.server.migrate(&target, &request).await {
            Ok(()) => {
                self.platform
                    .remote_log
                    .info(&format!("Migrated to {target}"));
                if let Err(e) = self.cache.set_setting(SETTING_SERVER_URL, &target) {
                    warn!("Failed to persist server URL: {}", e);
                }
                run.migrated = true;
                run.fetch_attempts = 0;
                StageOutcome::Restart
            }
            Err(e) => {
                self.platform
                    .remote_log
                    .warn(&format!("Failed to migrate to {target}: {e}"));
                StageOutcome::Continue
            }
        }
    }

    pub(super) async fn setup_push(&self, run: &mut PassRun) -> StageOutcome {
        let Some(mode) = run.state.push_mode() else {
            return StageOutcome::Continue;
        };

        let keepalive = run
            .state
            .keepalive_time
            .filter(|secs| *secs >= MIN_KEEPALIVE_SECS)
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);

        let base = self.platform.server.current_url();
        let host = url::Url::parse(&base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let Some(host) = host else {
            warn!("Cannot derive push host from {}", base);
            return StageOutcome::Continue;
        };

        if let Err(e) = self
            .platform
            .push
            .connect(
                &host,
                mode,
                Duration::from_secs(u64::from(keepalive)),
                &run.device_id,
            )
            .await
        {
            warn!("Failed to connect push channel: {}", e);
        }
        StageOutcome::Continue
    }

    pub(super) async fn factory_reset(&self, run: &mut PassRun) -> StageOutcome {
        if !run.state.wants_factory_reset() {
            return StageOutcome::Continue;
        }
        let log = &self.platform.remote_log;
        log.info("Device reset by server request");

        match self
            .platform
            .server
            .confirm_device_reset(&run.device_id)
            .await
        {
            Ok(true) if self.platform.device.is_admin() => {
                if let Err(e) = self.platform.device.factory_reset().await {
                    log.warn(&format!("Device reset failed: {e}"));
                }
            }
            Ok(true) => log.warn("Device reset failed: no permissions"),
            Ok(false) | Err(_) => log.warn("Failed to confirm device reset on server"),
        }
        StageOutcome::Continue
    }

    pub(super) async fn remote_reboot(&self, run: &mut PassRun) -> StageOutcome {
        if !run.state.wants_reboot() {
            return StageOutcome::Continue;
        }
        let log = &self.platform.remote_log;
        log.info("Rebooting by server request");

        match self.platform.server.confirm_reboot(&run.device_id).await {
            Ok(true) if self.platform.device.is_admin() => {
                if let Err(e) = self.platform.device.reboot().await {
                    log.warn(&format!("Reboot failed: {e}"));
                }
            }
            Ok(true) => log.warn("Reboot failed: no permissions"),
            Ok(false) | Err(_) => log.warn("Failed to confirm reboot on server"),
        }
        StageOutcome::Continue
    }

    pub(super) async fn password_reset(&self, run: &mut PassRun) -> StageOutcome {
        let Some(password) = run.state.password_reset.clone() else {
            return StageOutcome::Continue;
        };
        let log = &self.platform.remote_log;

        match self.platform.device.reset_password(&password).await {
            Ok(()) => log.info("Password successfully changed"),
            Err(e) => log.warn(&format!("Failed to reset password: {e}")),
        }

        match self
            .platform
            .server
            .confirm_password_reset(&run.device_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Server declined password reset confirmation"),
            Err(e) => debug!("Password reset confirmation failed: {}", e),
        }
        StageOutcome::Continue
    }

    pub(super) async fn default_launcher(&self, run: &mut PassRun) -> StageOutcome {
        let device = &self.platform.device;

        if device.is_device_owner() {
            let own = self.platform.packages.own_package();
            let need_set = !run.state.wants_default_launcher_run();
            let is_ours = device
                .default_launcher()
                .is_some_and(|current| current.eq_ignore_ascii_case(own));

            let result = if need_set && !is_ours {
                info!("Setting {} as default launcher", own);
                device.set_default_launcher(own).await
            } else if !need_set && is_ours {
                info!("Restoring the system default launcher");
                device.clear_default_launcher(own).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!("Failed to update default launcher: {}", e);
            }
        }

        self.observer.on_policies_updated();
        StageOutcome::Continue
    }

    pub(super) async fn lock_restrictions(&self, run: &mut PassRun) -> StageOutcome {
        let Some(restrictions) = run
            .state
            .restrictions
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
        else {
            return StageOutcome::Continue;
        };

        if let Err(e) = self.platform.device.lock_restrictions(restrictions).await {
            warn!("Failed to lock restrictions: {}", e);
        }
        StageOutcome::Continue
    }

    pub(super) async fn apply_actions(&self, run: &mut PassRun) -> StageOutcome {
        if !self.platform.device.is_device_owner() {
            return StageOutcome::Continue;
        }
        for action in run.state.actions() {
            if let Err(e) = self.platform.device.apply_action(action).await {
                warn!("Failed to apply action {}: {}", action.action, e);
            }
        }
        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_server() {
        assert!(same_server("https://mdm.example.com/", "HTTPS://MDM.example.com"));
        assert!(!same_server("https://a.example.com", "https://b.example.com"));
    }
}
