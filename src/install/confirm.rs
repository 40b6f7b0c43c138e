// src/install/confirm.rs

//! Confirmation requests raised by the package installer
//!
//! When an install needs the user's approval the installer hands back an
//! intent to show. That intent is attacker-reachable data: a crafted one can
//! make the agent launch its own non-exported components or pass along URI
//! permissions. Only intents that resolve to some other package and carry no
//! URI grants are forwarded.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Intent the installer asks us to show the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationIntent {
    /// Action string, e.g. `android.content.pm.action.CONFIRM_INSTALL`
    pub action: String,
    /// Package of the component the intent resolves to, if resolvable
    pub target_package: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub grant_read_uri: bool,
    #[serde(default)]
    pub grant_write_uri: bool,
    /// Launch in a new task; always set on forwarded intents
    #[serde(default)]
    pub new_task: bool,
}

impl ConfirmationIntent {
    pub fn new(action: impl Into<String>, target_package: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target_package: Some(target_package.into()),
            data: None,
            grant_read_uri: false,
            grant_write_uri: false,
            new_task: false,
        }
    }
}

/// Validate an intent before forwarding it to the user
pub fn sanitize(intent: &ConfirmationIntent, own_package: &str) -> Result<ConfirmationIntent> {
    let Some(target) = intent.target_package.as_deref() else {
        return Err(Error::IntentRedirection(format!(
            "{} does not resolve to any component",
            intent.action
        )));
    };

    if target == own_package {
        return Err(Error::IntentRedirection(format!(
            "{} resolves to the agent itself",
            intent.action
        )));
    }

    if intent.grant_read_uri || intent.grant_write_uri {
        return Err(Error::IntentRedirection(format!(
            "{} carries URI permission grants",
            intent.action
        )));
    }

    let mut forwarded = intent.clone();
    forwarded.new_task = true;
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: &str = "com.example.agent";
    const CONFIRM: &str = "android.content.pm.action.CONFIRM_INSTALL";

    #[test]
    fn test_installer_intent_forwarded() {
        let intent = ConfirmationIntent::new(CONFIRM, "com.android.packageinstaller");
        let forwarded = sanitize(&intent, OWN).unwrap();
        assert!(forwarded.new_task);
        assert_eq!(
            forwarded.target_package.as_deref(),
            Some("com.android.packageinstaller")
        );
    }

    #[test]
    fn test_self_targeting_intent_rejected() {
        let intent = ConfirmationIntent::new(CONFIRM, OWN);
        assert!(matches!(
            sanitize(&intent, OWN),
            Err(Error::IntentRedirection(_))
        ));
    }

    #[test]
    fn test_uri_grants_rejected() {
        let mut intent = ConfirmationIntent::new(CONFIRM, "com.android.packageinstaller");
        intent.grant_write_uri = true;
        assert!(sanitize(&intent, OWN).is_err());

        intent.grant_write_uri = false;
        intent.grant_read_uri = true;
        assert!(sanitize(&intent, OWN).is_err());
    }

    #[test]
    fn test_unresolvable_intent_rejected() {
        let mut intent = ConfirmationIntent::new(CONFIRM, "x");
        intent.target_package = None;
        assert!(sanitize(&intent, OWN).is_err());
    }
}
