// tests/installs.rs

//! Silent installs and the correlation of asynchronous package events.

mod common;

use common::{Harness, InstallBehavior, MockPackages};
use mdm_agent::install::{ConfirmationIntent, FailureKind};
use mdm_agent::observer::ObserverEvent;
use mdm_agent::pipeline::GuardPolicy;
use mdm_agent::{InstallEvent, PassOutcome};
use std::sync::atomic::Ordering;
use std::time::Duration;

const MAIL_URL: &str = "https://mdm.example.com/files/mail.apk";
const CHAT_URL: &str = "https://mdm.example.com/files/chat.apk";
const CONFIRM_INSTALL: &str = "android.content.pm.action.CONFIRM_INSTALL";

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn mail_harness() -> Harness {
    let h = Harness::new();
    h.downloader.serve(MAIL_URL, b"mail-apk");
    h.server.set_document(&format!(
        r#"{{"applications": [
            {{"pkg": "com.example.mail", "name": "Mail", "version": "2.1", "url": "{MAIL_URL}", "runAfterInstall": true}}
        ]}}"#
    ));
    h
}

#[tokio::test]
async fn test_silent_install_success() {
    let h = mail_harness();
    let pipeline = h.pipeline();

    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);

    assert_eq!(
        h.packages.calls(),
        vec![
            "silent_install:com.example.mail".to_string(),
            "grant:com.example.mail".to_string(),
        ]
    );
    let observed = h.observed();
    let installing = observed
        .iter()
        .position(|e| *e == ObserverEvent::AppInstalling("com.example.mail".into()))
        .unwrap();
    let complete = observed
        .iter()
        .position(|e| *e == ObserverEvent::AppInstallComplete("com.example.mail".into()))
        .unwrap();
    assert!(installing < complete);
    assert_eq!(observed.last(), Some(&ObserverEvent::PassComplete));
    assert_eq!(h.downloader.leftovers(), 0);

    let to_run = pipeline.take_apps_to_run().await;
    assert_eq!(to_run.len(), 1);
    assert_eq!(to_run[0].package_id, "com.example.mail");
}

#[tokio::test]
async fn test_no_grant_without_device_owner() {
    let h = Harness::with_privileges(true, false);
    h.downloader.serve(MAIL_URL, b"mail-apk");
    h.server.set_document(&format!(
        r#"{{"applications": [{{"pkg": "com.example.mail", "url": "{MAIL_URL}"}}]}}"#
    ));

    h.pipeline().run_pass().await.unwrap();

    assert_eq!(
        h.packages.calls(),
        vec!["silent_install:com.example.mail".to_string()]
    );
}

#[tokio::test]
async fn test_installs_run_one_at_a_time() {
    let h = mail_harness();
    h.downloader.serve(CHAT_URL, b"chat-apk");
    h.server.set_document(&format!(
        r#"{{"applications": [
            {{"pkg": "com.example.mail", "url": "{MAIL_URL}"}},
            {{"pkg": "com.example.chat", "url": "{CHAT_URL}"}}
        ]}}"#
    ));

    h.pipeline().run_pass().await.unwrap();

    assert_eq!(
        h.packages.calls(),
        vec![
            "silent_install:com.example.mail".to_string(),
            "grant:com.example.mail".to_string(),
            "silent_install:com.example.chat".to_string(),
            "grant:com.example.chat".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_install_continues_pass() {
    let h = mail_harness();
    h.packages
        .set_behavior(InstallBehavior::Fail(FailureKind::Conflict));
    let pipeline = h.pipeline();

    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);

    let observed = h.observed();
    assert!(observed.contains(&ObserverEvent::AppInstallError("com.example.mail".into())));
    assert!(!observed.contains(&ObserverEvent::AppInstallComplete("com.example.mail".into())));
    assert_eq!(observed.last(), Some(&ObserverEvent::PassComplete));
    assert!(!h.packages.calls().iter().any(|c| c.starts_with("grant:")));
    assert!(pipeline.take_apps_to_run().await.is_empty());
    assert_eq!(h.downloader.leftovers(), 0);
}

#[tokio::test]
async fn test_rejected_submission_moves_on() {
    let h = mail_harness();
    h.downloader.serve(CHAT_URL, b"chat-apk");
    h.server.set_document(&format!(
        r#"{{"applications": [
            {{"pkg": "com.example.mail", "url": "{MAIL_URL}"}},
            {{"pkg": "com.example.chat", "url": "{CHAT_URL}"}}
        ]}}"#
    ));
    h.packages.set_behavior(InstallBehavior::Reject);

    assert_eq!(h.pipeline().run_pass().await.unwrap(), PassOutcome::Completed);

    assert_eq!(h.packages.submitted.load(Ordering::SeqCst), 2);
    let observed = h.observed();
    assert!(observed.contains(&ObserverEvent::AppInstallError("com.example.mail".into())));
    assert!(observed.contains(&ObserverEvent::AppInstallError("com.example.chat".into())));
    assert_eq!(h.downloader.leftovers(), 0);
}

#[tokio::test]
async fn test_user_confirmation_is_sanitized() {
    let h = mail_harness();
    h.packages.set_behavior(InstallBehavior::Manual);
    let pipeline = h.pipeline();

    let driver = async {
        wait_until(|| h.packages.submitted.load(Ordering::SeqCst) >= 1).await;

        // Redirect into the agent itself: dropped
        h.packages.emit(InstallEvent::pending_user_action(
            "com.example.mail",
            ConfirmationIntent::new(CONFIRM_INSTALL, MockPackages::OWN_PACKAGE),
        ));
        // URI grants: dropped
        let mut granting = ConfirmationIntent::new("GRANTING", "com.android.packageinstaller");
        granting.grant_read_uri = true;
        h.packages
            .emit(InstallEvent::pending_user_action("com.example.mail", granting));
        // The installer's own dialog: shown
        h.packages.emit(InstallEvent::pending_user_action(
            "com.example.mail",
            ConfirmationIntent::new(CONFIRM_INSTALL, "com.android.packageinstaller"),
        ));
        // Someone else's install finishing
        h.packages.emit(InstallEvent::success("com.example.other"));

        wait_until(|| h.packages.calls().iter().any(|c| c.starts_with("confirm:"))).await;
        assert!(pipeline.is_running());

        h.packages.install("com.example.mail", "2.1");
        h.packages.emit(InstallEvent::success("com.example.mail"));
    };

    let (outcome, ()) = tokio::join!(pipeline.run_pass(), driver);

    assert_eq!(outcome.unwrap(), PassOutcome::Completed);
    assert_eq!(
        h.packages.calls(),
        vec![
            "silent_install:com.example.mail".to_string(),
            format!("confirm:{CONFIRM_INSTALL}"),
            "grant:com.example.mail".to_string(),
        ]
    );
    let observed = h.observed();
    assert!(observed.contains(&ObserverEvent::AppInstallComplete("com.example.mail".into())));
    assert!(!observed.contains(&ObserverEvent::AppInstallComplete("com.example.other".into())));
}

#[tokio::test]
async fn test_install_timeout_abandons_pending() {
    let h = mail_harness();
    h.packages.set_behavior(InstallBehavior::Manual);
    let pipeline = h.pipeline_with(h.config().with_install_timeout(Duration::from_millis(50)));

    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);

    let observed = h.observed();
    assert!(observed.contains(&ObserverEvent::AppInstallError("com.example.mail".into())));
    assert_eq!(observed.last(), Some(&ObserverEvent::PassComplete));
    assert_eq!(h.downloader.leftovers(), 0);
}

#[tokio::test]
async fn test_late_event_from_previous_pass_ignored() {
    let h = mail_harness();
    h.packages.set_behavior(InstallBehavior::Manual);
    let pipeline = h.pipeline_with(h.config().with_install_timeout(Duration::from_millis(50)));
    pipeline.run_pass().await.unwrap();

    // The abandoned install reports in while nothing is pending
    h.packages.emit(InstallEvent::success("com.example.mail"));
    h.packages.set_behavior(InstallBehavior::Succeed);
    h.clear_observed();

    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);
    let completions = h
        .observed()
        .into_iter()
        .filter(|e| matches!(e, ObserverEvent::AppInstallComplete(_)))
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_unprivileged_install_asks_user() {
    let h = Harness::with_privileges(false, false);
    h.downloader.serve(MAIL_URL, b"mail-apk");
    h.server.set_document(&format!(
        r#"{{"applications": [
            {{"pkg": "com.example.mail", "url": "{MAIL_URL}", "runAfterInstall": true}},
            {{"pkg": "com.example.old", "remove": true}}
        ]}}"#
    ));
    h.packages.install("com.example.old", "1.0");
    let pipeline = h.pipeline();

    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);

    let calls = h.packages.calls();
    assert_eq!(calls[0], "user_uninstall:com.example.old");
    assert!(calls[1].starts_with("user_install:"));
    assert_eq!(calls.len(), 2);
    assert_eq!(h.packages.submitted.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.take_apps_to_run().await.len(), 1);
}

/// The install event never arrives; later triggers must not wedge
async fn lost_event_then_trigger(policy: GuardPolicy) -> (Harness, PassOutcome, PassOutcome) {
    let h = mail_harness();
    h.packages.set_behavior(InstallBehavior::Manual);
    let pipeline = h.pipeline_with(
        h.config()
            .with_guard_policy(policy)
            .with_install_timeout(Duration::from_millis(100)),
    );

    let first = pipeline.run_pass();
    let second = async {
        wait_until(|| h.packages.submitted.load(Ordering::SeqCst) >= 1).await;
        pipeline.run_pass().await
    };
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    // Nothing pending any more: a fresh pass installs normally
    h.packages.set_behavior(InstallBehavior::Succeed);
    assert_eq!(pipeline.run_pass().await.unwrap(), PassOutcome::Completed);
    assert_eq!(h.packages.version_of("com.example.mail").as_deref(), Some("installed"));
    (h, first, second)
}

#[tokio::test]
async fn test_lost_install_event_releases_guard() {
    let (h, first, second) = lost_event_then_trigger(GuardPolicy::AtCompletion).await;

    assert_eq!(first, PassOutcome::Completed);
    assert_eq!(second, PassOutcome::AlreadyRunning);
    assert!(h.observed().contains(&ObserverEvent::AppInstallError("com.example.mail".into())));
}

#[tokio::test]
async fn test_lost_install_event_unblocks_overlapping_pass() {
    let (h, first, second) = lost_event_then_trigger(GuardPolicy::AfterFetch).await;

    assert_eq!(first, PassOutcome::Completed);
    // The overlapping pass waited for the stage lock and then resubmitted
    assert_eq!(second, PassOutcome::Completed);
    assert_eq!(h.server.fetch_count(), 3);
    assert_eq!(h.packages.submitted.load(Ordering::SeqCst), 3);
}
