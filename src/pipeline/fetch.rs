// src/pipeline/fetch.rs

//! Fetch stage
//!
//! A network failure is retried once per pass. After the second failure a
//! cached document, when there is one, lets the pass continue in degraded
//! mode unless the operator asked to abort or the document wants the Wi-Fi
//! settings shown. Anything the server actually said that is not a usable
//! document ends the pass.

use super::{PassRun, Pipeline, StageOutcome};
use crate::error::Error;
use crate::hash;
use crate::ledger::SETTING_DEVICE_ID;
use crate::model::DesiredState;
use crate::platform::FetchRequest;
use tracing::{debug, info, warn};

/// Network attempts per pass before giving up on the server
const FETCH_ATTEMPTS: u32 = 2;

impl Pipeline {
    pub(super) fn fetch_request(&self, device_id: &str, first_contact: bool) -> FetchRequest {
        let create_options = if first_contact {
            self.config
                .create_options
                .clone()
                .filter(|options| !options.is_empty())
        } else {
            None
        };

        FetchRequest {
            device_id: device_id.to_string(),
            signature: hash::signature(&self.config.request_secret, device_id),
            create_options,
        }
    }

    pub(super) async fn fetch(&self, run: &mut PassRun) -> StageOutcome {
        run.fetch_attempts += 1;
        let cached = self.cached_state();
        let request = self.fetch_request(&run.device_id, cached.is_none());

        debug!(
            "Fetching desired state for {} (attempt {})",
            run.device_id, run.fetch_attempts
        );

        match self.platform.server.fetch_desired_state(&request).await {
            Ok(document) => match DesiredState::from_json(&document) {
                Ok(state) => {
                    self.accept_state(run, state, &document).await;
                    StageOutcome::Continue
                }
                Err(e) => {
                    self.platform
                        .remote_log
                        .error(&format!("Malformed desired state: {e}"));
                    StageOutcome::ServerError
                }
            },
            Err(e) if e.is_network() => self.network_failure(run, cached, &e),
            Err(e) => {
                self.platform
                    .remote_log
                    .error(&format!("Failed to fetch desired state: {e}"));
                StageOutcome::ServerError
            }
        }
    }

    /// Adopt a freshly fetched document and cache it
    async fn accept_state(&self, run: &mut PassRun, mut state: DesiredState, document: &str) {
        let renumbered = state
            .new_number
            .take()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let stored = match renumbered {
            Some(number) => {
                self.platform.remote_log.info(&format!(
                    "Device number changed from {} to {}",
                    run.device_id, number
                ));
                if let Err(e) = self.cache.set_setting(SETTING_DEVICE_ID, &number) {
                    warn!("Failed to store new device number: {}", e);
                }
                run.device_id = number;
                self.platform.push.disconnect().await;
                state
                    .to_json()
                    .and_then(|json| self.cache.store_state(&json))
            }
            None => self.cache.store_state(document),
        };

        if let Err(e) = stored {
            warn!("Failed to cache desired state: {}", e);
        }

        info!(
            "Desired state received: {} files, {} applications",
            state.files.len(),
            state.applications.len()
        );
        run.state = state;
    }

    fn network_failure(
        &self,
        run: &mut PassRun,
        cached: Option<DesiredState>,
        error: &Error,
    ) -> StageOutcome {
        if run.fetch_attempts < FETCH_ATTEMPTS {
            warn!("Fetch failed, will retry: {}", error);
            return StageOutcome::Retry;
        }

        self.platform
            .remote_log
            .warn(&format!("Failed to reach the server: {error}"));

        match cached {
            Some(state) if !self.config.abort_on_error => {
                if state.shows_wifi() {
                    return StageOutcome::NetworkError;
                }
                info!("Continuing with the cached desired state");
                run.state = state;
                StageOutcome::Degraded
            }
            _ => StageOutcome::NetworkError,
        }
    }
}
